//! Prompt assembly for the agent subprocess
//!
//! The input is an ordered, sectioned document: identity header, persona,
//! resources, memory, recent conversation, tools, rules, the request
//! itself, channel guidance and the selected skills. Sections with nothing
//! to say are omitted entirely.

pub mod skills;

use crate::config::Config;
use crate::error::Result;
use crate::store::{SourceType, Store, Task};
use chrono::{DateTime, Utc};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

/// History from these sources is noise in a conversation, not context.
const HISTORY_EXCLUDED_SOURCES: &[SourceType] = &[SourceType::Scheduled, SourceType::Briefing];

pub struct PromptBuilder {
    store: Arc<Store>,
    config: Arc<Config>,
}

impl PromptBuilder {
    pub fn new(store: Arc<Store>, config: Arc<Config>) -> Self {
        Self { store, config }
    }

    pub fn build(&self, task: &Task, now: DateTime<Utc>) -> Result<String> {
        let mut out = String::new();

        // Header
        let _ = writeln!(out, "# Assistant context");
        let _ = writeln!(out, "Task {} for user {}.", task.id, task.user_id);
        let _ = writeln!(
            out,
            "Now: {}. Task created: {}. Source: {}.",
            now.to_rfc3339(),
            task.created_at.to_rfc3339(),
            task.source_type
        );
        out.push('\n');

        // Persona
        if let Some(persona) = read_optional(self.config.prompt.persona_file.as_deref()) {
            let _ = writeln!(out, "## Persona\n{}\n", persona.trim());
        }

        // Resources
        let resources = self.store.list_resources(&task.user_id)?;
        if !resources.is_empty() {
            let _ = writeln!(out, "## Your resources");
            for resource in &resources {
                let name = resource
                    .display_name
                    .as_deref()
                    .unwrap_or(resource.resource_path.as_str());
                let _ = writeln!(
                    out,
                    "- {} ({}, {}): {}",
                    name, resource.resource_type, resource.permissions, resource.resource_path
                );
            }
            out.push('\n');
        }

        // Long-term and channel memory
        let memory_dir = self.config.users.get(&task.user_id).and_then(|u| u.memory_dir.clone());
        if let Some(dir) = &memory_dir {
            if let Some(memory) = read_optional(Some(&dir.join("MEMORY.md"))) {
                let _ = writeln!(out, "## What you remember about the user\n{}\n", memory.trim());
            }
            if let Some(token) = &task.conversation_token {
                let channel_file = dir.join("channels").join(format!("{token}.md"));
                if let Some(memory) = read_optional(Some(&channel_file)) {
                    let _ = writeln!(out, "## Channel notes\n{}\n", memory.trim());
                }
            }
        }

        // Recent conversation
        if let Some(token) = &task.conversation_token {
            let history = self.store.conversation_history(
                token,
                Some(task.id),
                self.config.prompt.history_limit,
                HISTORY_EXCLUDED_SOURCES,
            )?;
            if !history.is_empty() {
                let _ = writeln!(out, "## Recent conversation (oldest first)");
                for entry in history.iter().rev() {
                    if let Some(prompt) = &entry.prompt {
                        let _ = writeln!(out, "User: {}", prompt.trim());
                    }
                    if let Some(result) = &entry.result {
                        let _ = writeln!(out, "You: {}", result.trim());
                    }
                }
                out.push('\n');
            }
        }

        // Tool inventory
        if !self.config.executor.allowed_tools.is_empty() {
            let _ = writeln!(out, "## Available tools");
            for tool in &self.config.executor.allowed_tools {
                let _ = writeln!(out, "- {tool}");
            }
            out.push('\n');
        }

        // Behavioral rules
        if !self.config.prompt.behavioral_rules.is_empty() {
            let _ = writeln!(out, "## Rules");
            for rule in &self.config.prompt.behavioral_rules {
                let _ = writeln!(out, "- {rule}");
            }
            out.push('\n');
        }

        // The request itself
        let _ = writeln!(out, "## Current request");
        if let Some(prompt) = &task.prompt {
            let _ = writeln!(out, "{}", prompt.trim());
        }
        if task.confirmed_at.is_some() {
            if let Some(confirmation) = &task.confirmation_prompt {
                let _ = writeln!(out, "\nThe user already confirmed: {}", confirmation.trim());
            }
        }
        if !task.attachments.is_empty() {
            let _ = writeln!(out, "\nAttachments:");
            for attachment in &task.attachments {
                let _ = writeln!(out, "- {attachment}");
            }
        }
        out.push('\n');

        // Channel-specific guidance
        if let Some(guidance) =
            self.config.prompt.channel_guidelines.get(task.source_type.as_str())
        {
            let _ = writeln!(out, "## Channel guidance\n{}\n", guidance.trim());
        }

        // Skills
        let selected = skills::select_skills(&self.config, task, &resources);
        if !self.config.skills.is_empty() {
            let _ = writeln!(out, "## Skills (set {})", skills::changelog(&self.config.skills));
            for skill in &selected {
                match read_optional(Some(&skill.doc_path)) {
                    Some(doc) => {
                        let _ = writeln!(out, "### {}\n{}\n", skill.name, doc.trim());
                    }
                    None => {
                        let _ = writeln!(out, "### {}\n(documentation missing)\n", skill.name);
                    }
                }
            }
        }

        Ok(out)
    }
}

fn read_optional(path: Option<&Path>) -> Option<String> {
    let path = path?;
    std::fs::read_to_string(path).ok().filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserConfig;
    use crate::store::{NewTask, TaskStatus};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn setup() -> (Arc<Store>, Arc<Config>) {
        (Arc::new(Store::open_in_memory().unwrap()), Arc::new(Config::default()))
    }

    #[test]
    fn sections_appear_in_order() {
        let (store, _) = setup();
        let mut config = Config::default();
        config.prompt.behavioral_rules = vec!["Be brief.".into()];
        config
            .prompt
            .channel_guidelines
            .insert("chat".into(), "Use casual tone.".into());
        let config = Arc::new(config);

        store
            .upsert_resource("alice", "spreadsheet", "/shared/budget.ods", "read", Some("Budget"), now())
            .unwrap();

        let mut new = NewTask::prompt("alice", SourceType::Chat, "what's my balance?");
        new.conversation_token = Some("room-1".into());
        new.attachments = vec!["/inbox/statement.pdf".into()];
        let id = store.create_task(&new, now()).unwrap();
        let task = store.get_task(id).unwrap().unwrap();

        let prompt = PromptBuilder::new(store, config).build(&task, now()).unwrap();

        let sections = [
            "# Assistant context",
            "## Your resources",
            "## Rules",
            "## Current request",
            "## Channel guidance",
        ];
        let mut last = 0;
        for section in sections {
            let pos = prompt.find(section).unwrap_or_else(|| panic!("missing {section}"));
            assert!(pos >= last, "{section} out of order");
            last = pos;
        }
        assert!(prompt.contains("Budget (spreadsheet, read)"));
        assert!(prompt.contains("what's my balance?"));
        assert!(prompt.contains("/inbox/statement.pdf"));
        assert!(prompt.contains("Use casual tone."));
    }

    #[test]
    fn history_is_included_oldest_first_without_scheduled_noise() {
        let (store, config) = setup();

        for (i, source) in [SourceType::Chat, SourceType::Scheduled, SourceType::Chat]
            .iter()
            .enumerate()
        {
            let mut new = NewTask::prompt("alice", *source, format!("q{i}"));
            new.conversation_token = Some("room-1".into());
            let id = store
                .create_task(&new, now() + chrono::Duration::seconds(i as i64))
                .unwrap();
            store
                .update_task_status(id, TaskStatus::Completed, Some(&format!("a{i}")), None, None, now())
                .unwrap();
        }

        let mut new = NewTask::prompt("alice", SourceType::Chat, "follow-up");
        new.conversation_token = Some("room-1".into());
        let id = store.create_task(&new, now() + chrono::Duration::seconds(10)).unwrap();
        let task = store.get_task(id).unwrap().unwrap();

        let prompt = PromptBuilder::new(store, config).build(&task, now()).unwrap();
        assert!(prompt.contains("User: q0"));
        assert!(prompt.contains("User: q2"));
        assert!(!prompt.contains("q1"), "scheduled task leaked into history");
        assert!(prompt.find("q0").unwrap() < prompt.find("q2").unwrap());
    }

    #[test]
    fn memory_files_are_read_when_configured() {
        let (store, _) = setup();
        let dir = std::env::temp_dir().join(format!("istota-test-mem-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("channels")).unwrap();
        std::fs::write(dir.join("MEMORY.md"), "Prefers metric units.").unwrap();
        std::fs::write(dir.join("channels/room-1.md"), "This room is for groceries.").unwrap();

        let mut config = Config::default();
        config.users.insert(
            "alice".into(),
            UserConfig { memory_dir: Some(dir.clone()), ..Default::default() },
        );

        let mut new = NewTask::prompt("alice", SourceType::Chat, "hi");
        new.conversation_token = Some("room-1".into());
        let id = store.create_task(&new, now()).unwrap();
        let task = store.get_task(id).unwrap().unwrap();

        let prompt = PromptBuilder::new(store, Arc::new(config)).build(&task, now()).unwrap();
        assert!(prompt.contains("Prefers metric units."));
        assert!(prompt.contains("This room is for groceries."));

        let _ = std::fs::remove_dir_all(dir);
    }
}
