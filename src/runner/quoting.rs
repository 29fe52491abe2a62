//! Command-template substitution and shell quoting.
//!
//! Quoting rule: space-split with single-quote escaping — a literal single
//! quote inside a field becomes `'\''`.

/// Quote `field` for inclusion in a shell command line, wrapping it in
/// single quotes and escaping any embedded single quote as `'\''`.
pub fn shell_quote(field: &str) -> String {
    if !field.is_empty() && field.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.')) {
        return field.to_string();
    }
    let escaped = field.replace('\'', r"'\''");
    format!("'{escaped}'")
}

/// Substitute `{prompt}` and `{prompt_path}` placeholders in `template`,
/// shell-quoting each substituted value. Any other `{...}` placeholder is
/// left untouched.
pub fn render_command(template: &str, prompt: &str, prompt_path: Option<&str>) -> String {
    let mut out = template.replace("{prompt}", &shell_quote(prompt));
    if let Some(path) = prompt_path {
        out = out.replace("{prompt_path}", &shell_quote(path));
    }
    out
}

/// Split a rendered command line into argv-style tokens: whitespace-separated
/// fields, honoring single-quoted segments (the only quoting style this
/// system produces or needs to parse back).
pub fn split_command(command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = command.chars().peekable();
    let mut has_token = false;

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_quotes = !in_quotes;
                has_token = true;
                // Handle the `'\''` escape: closing quote, escaped quote, reopening quote.
                if !in_quotes && chars.peek() == Some(&'\\') {
                    let mut lookahead = chars.clone();
                    lookahead.next();
                    if lookahead.peek() == Some(&'\'') {
                        chars.next();
                        chars.next();
                        current.push('\'');
                        in_quotes = true;
                    }
                }
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_field_is_unquoted() {
        assert_eq!(shell_quote("hello"), "hello");
    }

    #[test]
    fn field_with_spaces_is_single_quoted() {
        assert_eq!(shell_quote("hello world"), "'hello world'");
    }

    #[test]
    fn embedded_single_quote_is_escaped() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn render_command_substitutes_prompt_placeholder() {
        let rendered = render_command("harness --prompt {prompt}", "do the thing", None);
        assert_eq!(rendered, "harness --prompt 'do the thing'");
    }

    #[test]
    fn render_command_substitutes_both_placeholders() {
        let rendered = render_command("harness {prompt} --file {prompt_path}", "hi", Some("/tmp/p.txt"));
        assert_eq!(rendered, "harness hi --file /tmp/p.txt");
    }

    #[test]
    fn split_command_splits_on_whitespace_honoring_quotes() {
        let tokens = split_command("harness --prompt 'do the thing' --flag");
        assert_eq!(tokens, vec!["harness", "--prompt", "do the thing", "--flag"]);
    }

    #[test]
    fn split_command_handles_escaped_quote() {
        let tokens = split_command(shell_quote("it's").as_str());
        assert_eq!(tokens, vec!["it's"]);
    }
}
