//! String template rendering utilities.
//!
//! Commands in routine steps use `{{var}}` placeholders resolved against the
//! run environment. Unknown placeholders are left in place so a missing
//! variable is visible in the command log rather than silently vanishing.

use std::collections::BTreeMap;

pub struct TemplateVars;

impl TemplateVars {
    pub const GITHUB_URL: &'static str = "github_url";
    pub const GITHUB_DIR: &'static str = "github_dir";
    pub const GITHUB_BRANCH: &'static str = "github_branch";
}

pub fn render(template: &str, variables: &[(&str, &str)]) -> String {
    let mut result = template.to_string();

    for (key, value) in variables {
        let placeholder = format!("{{{{{}}}}}", key);
        result = result.replace(&placeholder, value);
    }

    result
}

pub fn render_map(template: &str, variables: &BTreeMap<String, String>) -> String {
    let mut result = template.to_string();

    for (key, value) in variables {
        let placeholder = format!("{{{{{}}}}}", key);
        result = result.replace(&placeholder, value);
    }

    result
}

pub fn is_present(template: &str, key: &str) -> bool {
    let placeholder = format!("{{{{{}}}}}", key);
    template.contains(&placeholder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_replaces_all_occurrences() {
        let out = render("echo {{msg}} && echo {{msg}}", &[("msg", "hi")]);
        assert_eq!(out, "echo hi && echo hi");
    }

    #[test]
    fn render_map_uses_env_values() {
        let mut vars = BTreeMap::new();
        vars.insert("github_branch".to_string(), "main".to_string());
        let out = render_map("git checkout {{github_branch}}", &vars);
        assert_eq!(out, "git checkout main");
    }

    #[test]
    fn unknown_placeholder_is_left_in_place() {
        let out = render("echo {{missing}}", &[("msg", "hi")]);
        assert_eq!(out, "echo {{missing}}");
    }

    #[test]
    fn is_present_detects_placeholder() {
        assert!(is_present("run {{args}}", "args"));
        assert!(!is_present("run args", "args"));
    }
}
