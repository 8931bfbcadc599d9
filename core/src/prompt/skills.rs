//! Skill selection and the skills changelog
//!
//! Skills are documentation files with predicates. A skill is included
//! when any predicate matches the task: a prompt keyword, the source type,
//! a resource type the user owns, or an attachment extension.
//! Admin-gated skills are filtered out for non-admin users.

use crate::config::{Config, SkillConfig};
use crate::store::{Task, UserResource};
use sha2::{Digest, Sha256};

/// Skills applicable to `task`, in configuration order.
pub fn select_skills<'a>(
    config: &'a Config,
    task: &Task,
    resources: &[UserResource],
) -> Vec<&'a SkillConfig> {
    let is_admin = config.is_admin(&task.user_id);
    let prompt_lower = task.prompt.as_deref().unwrap_or("").to_lowercase();
    let resource_types: Vec<&str> =
        resources.iter().map(|r| r.resource_type.as_str()).collect();

    config
        .skills
        .iter()
        .filter(|skill| is_admin || !skill.admin_only)
        .filter(|skill| {
            if skill.always_include {
                return true;
            }
            if skill.keywords.iter().any(|k| prompt_lower.contains(&k.to_lowercase())) {
                return true;
            }
            if skill.source_types.iter().any(|s| s == task.source_type.as_str()) {
                return true;
            }
            if skill.resource_types.iter().any(|t| resource_types.contains(&t.as_str())) {
                return true;
            }
            skill.extensions.iter().any(|ext| {
                task.attachments.iter().any(|a| {
                    a.rsplit('.').next().is_some_and(|e| e.eq_ignore_ascii_case(ext))
                })
            })
        })
        .collect()
}

/// A short fingerprint of the installed skill set, so the agent can tell
/// when its instructions changed. Truncating SHA-256 to 12 hex characters
/// leaves 48 bits; collisions are negligible at realistic skill counts.
pub fn changelog(skills: &[SkillConfig]) -> String {
    let mut hasher = Sha256::new();
    let mut names: Vec<&SkillConfig> = skills.iter().collect();
    names.sort_by(|a, b| a.name.cmp(&b.name));
    for skill in names {
        hasher.update(skill.name.as_bytes());
        hasher.update([0]);
        if let Ok(doc) = std::fs::read(&skill.doc_path) {
            hasher.update(&doc);
        }
        hasher.update([0]);
    }
    hex::encode(hasher.finalize())[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewTask, SourceType, Store};
    use chrono::{TimeZone, Utc};

    fn skill(name: &str) -> SkillConfig {
        SkillConfig { name: name.into(), doc_path: format!("/nonexistent/{name}.md").into(), ..Default::default() }
    }

    fn task_with_prompt(prompt: &str) -> Task {
        let store = Store::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let id = store
            .create_task(&NewTask::prompt("alice", SourceType::Chat, prompt), now)
            .unwrap();
        store.get_task(id).unwrap().unwrap()
    }

    #[test]
    fn keyword_source_and_extension_predicates_select() {
        let mut config = Config::default();

        let mut calendar = skill("calendar");
        calendar.keywords = vec!["meeting".into(), "appointment".into()];
        config.skills.push(calendar);

        let mut briefing = skill("briefing-style");
        briefing.source_types = vec!["briefing".into()];
        config.skills.push(briefing);

        let mut ocr = skill("ocr");
        ocr.extensions = vec!["pdf".into()];
        config.skills.push(ocr);

        let mut always = skill("house-rules");
        always.always_include = true;
        config.skills.push(always);

        let mut task = task_with_prompt("schedule a meeting for tuesday");
        task.attachments = vec!["/inbox/scan.PDF".into()];

        let names: Vec<&str> =
            select_skills(&config, &task, &[]).iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["calendar", "ocr", "house-rules"]);
    }

    #[test]
    fn admin_gated_skills_are_hidden_from_regular_users() {
        let mut config = Config::default();
        let mut admin_skill = skill("accounting");
        admin_skill.always_include = true;
        admin_skill.admin_only = true;
        config.skills.push(admin_skill);

        let task = task_with_prompt("do the books");
        assert!(select_skills(&config, &task, &[]).is_empty());

        config.users.insert(
            "alice".into(),
            crate::config::UserConfig { admin: true, ..Default::default() },
        );
        assert_eq!(select_skills(&config, &task, &[]).len(), 1);
    }

    #[test]
    fn changelog_is_12_hex_and_order_independent() {
        let a = skill("alpha");
        let b = skill("beta");
        let forward = changelog(&[a.clone(), b.clone()]);
        let reverse = changelog(&[b, a]);

        assert_eq!(forward.len(), 12);
        assert!(forward.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(forward, reverse);
        assert_ne!(forward, changelog(&[skill("gamma")]));
    }
}
