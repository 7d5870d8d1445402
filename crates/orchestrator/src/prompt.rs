//! Prompt assembly for the code-generation agent.

use state::entity::comments;

/// Prompt for the initial generation pass: the app identity the generated
/// client must embed, the requirements (first build only), and the
/// submitted comments in input order. Empty sections are omitted.
pub fn build_prompt(app_id: &str, requirements: &str, comments: &[comments::Model]) -> String {
    let mut prompt = String::new();

    prompt.push_str("## App Configuration\n");
    prompt.push_str(&format!("App ID: {}\n", app_id));
    prompt.push_str("IMPORTANT: Configure the AppforgeProvider with this appId in src/App.jsx:\n");
    prompt.push_str(&format!("<AppforgeProvider appId=\"{}\">\n\n", app_id));

    if !requirements.is_empty() {
        prompt.push_str("## Requirements\n");
        prompt.push_str(requirements);
        prompt.push_str("\n\n");
    }

    if !comments.is_empty() {
        prompt.push_str("## User Comments\n");
        for comment in comments {
            prompt.push_str(&format!("Page: {}\n", comment.page_path));
            prompt.push_str(&format!("Element: {}\n", comment.element_path));
            prompt.push_str(&format!("Comment: {}\n\n", comment.content));
        }
    }

    prompt
}

/// Prompt for a repair pass after a failed prebuild. The full tool output
/// goes in verbatim; the agent needs all of it to find the break.
pub fn repair_prompt(attempt: u32, max_attempts: u32, build_output: &str) -> String {
    format!(
        "BUILD FAILED (Attempt {}/{}):\n\n{}\n\n\
         Please analyze the errors above and fix them. Focus on:\n\
         - Syntax errors\n\
         - Type errors\n\
         - Import/export issues\n\
         - Missing dependencies\n\
         - Build configuration issues\n\n\
         Fix the issues directly in the code.",
        attempt, max_attempts, build_output
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use state::entity::comments::CommentStatus;

    fn comment(page: &str, element: &str, content: &str) -> comments::Model {
        comments::Model {
            id: "c-1".to_string(),
            app_id: "a-1".to_string(),
            version_id: Some("v-1".to_string()),
            user_id: "u-1".to_string(),
            page_path: page.to_string(),
            element_path: element.to_string(),
            content: content.to_string(),
            status: CommentStatus::Submitted,
            created_at: Utc::now(),
            submitted_at: Some(Utc::now()),
        }
    }

    #[test]
    fn test_first_build_prompt_has_requirements() {
        let prompt = build_prompt("app-1", "Display HELLO with current date.", &[]);

        assert!(prompt.contains("App ID: app-1"));
        assert!(prompt.contains("<AppforgeProvider appId=\"app-1\">"));
        assert!(prompt.contains("## Requirements"));
        assert!(prompt.contains("Display HELLO with current date."));
        assert!(!prompt.contains("## User Comments"));
    }

    #[test]
    fn test_iteration_prompt_formats_comments_in_order() {
        let comments = vec![
            comment("/", "h1", "Make it purple"),
            comment("/about", "general", "Add a footer"),
        ];
        let prompt = build_prompt("app-1", "", &comments);

        assert!(!prompt.contains("## Requirements"));
        assert!(prompt.contains("## User Comments"));
        assert!(prompt.contains("Page: /\nElement: h1\nComment: Make it purple\n"));

        let first = prompt.find("Make it purple").unwrap();
        let second = prompt.find("Add a footer").unwrap();
        assert!(first < second, "comments must keep input order");
    }

    #[test]
    fn test_repair_prompt_carries_full_output() {
        let prompt = repair_prompt(2, 3, "error TS2304: Cannot find name 'Foo'.");
        assert!(prompt.starts_with("BUILD FAILED (Attempt 2/3):"));
        assert!(prompt.contains("error TS2304"));
        assert!(prompt.contains("Fix the issues directly in the code."));
    }
}
