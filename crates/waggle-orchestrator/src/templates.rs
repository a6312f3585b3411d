use waggle_core::{RoleTemplate, WaggleResult};
use waggle_store::PositionStore;

/// Built-in role templates installed on first run.
///
/// Positions reference templates by name; these cover the common
/// plan → build → review division of labor and can be overridden by saving
/// a template with the same name.
pub fn default_templates() -> Vec<RoleTemplate> {
    vec![planner_template(), builder_template(), reviewer_template()]
}

fn planner_template() -> RoleTemplate {
    RoleTemplate {
        name: "planner".to_string(),
        description: "Breaks work into tasks and routes them to other positions".to_string(),
        system_prompt: PLANNER_PROMPT.to_string(),
        model: "claude-sonnet".to_string(),
        max_turns: 30,
        timeout_secs: None,
    }
}

fn builder_template() -> RoleTemplate {
    RoleTemplate {
        name: "builder".to_string(),
        description: "Executes concrete work items".to_string(),
        system_prompt: BUILDER_PROMPT.to_string(),
        model: "claude-sonnet".to_string(),
        max_turns: 20,
        timeout_secs: None,
    }
}

fn reviewer_template() -> RoleTemplate {
    RoleTemplate {
        name: "reviewer".to_string(),
        description: "Checks completed work before it moves on".to_string(),
        system_prompt: REVIEWER_PROMPT.to_string(),
        model: "claude-sonnet".to_string(),
        max_turns: 10,
        timeout_secs: None,
    }
}

/// Install every default template that is not already present.
/// Returns how many were written.
pub async fn install_default_templates(store: &dyn PositionStore) -> WaggleResult<usize> {
    let mut installed = 0;
    for template in default_templates() {
        if store.load_template(&template.name).await?.is_none() {
            store.save_template(&template).await?;
            installed += 1;
        }
    }
    Ok(installed)
}

const PLANNER_PROMPT: &str = "\
You are a planner position in a Waggle worker pool. Break incoming requests \
into concrete tasks and dispatch them to the appropriate positions. Keep \
tasks small and independent where possible, and state the expected result \
for each one.
";

const BUILDER_PROMPT: &str = "\
You are a builder position in a Waggle worker pool. Execute the task you \
are given and produce its result directly. Do not take on work beyond the \
task payload; anything out of scope goes back to the planner.
";

const REVIEWER_PROMPT: &str = "\
You are a reviewer position in a Waggle worker pool. Inspect the completed \
work in the task payload and report problems precisely. Approve only work \
that actually satisfies the request it came from.
";

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use waggle_store::FilePositionStore;

    #[test]
    fn test_default_templates_cover_roles() {
        let templates = default_templates();
        let names: Vec<&str> = templates.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["planner", "builder", "reviewer"]);
        for template in &templates {
            assert!(!template.system_prompt.is_empty());
        }
    }

    #[tokio::test]
    async fn test_install_is_idempotent_and_preserves_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePositionStore::new(dir.path()).await.unwrap();

        assert_eq!(install_default_templates(&store).await.unwrap(), 3);
        assert_eq!(install_default_templates(&store).await.unwrap(), 0);

        // A user-modified template is not clobbered by a reinstall.
        let mut custom = default_templates().remove(0);
        custom.max_turns = 99;
        store.save_template(&custom).await.unwrap();
        install_default_templates(&store).await.unwrap();
        let kept = store.load_template("planner").await.unwrap().unwrap();
        assert_eq!(kept.max_turns, 99);
    }
}
