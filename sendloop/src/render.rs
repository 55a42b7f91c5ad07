//! Template rendering: per-contact variable substitution.
//!
//! Substitution never fails: an unknown `{{variable}}` renders as the empty
//! string so a missing contact field can never abort a dispatch.

use std::collections::HashMap;

use tracing::debug;

use crate::model::{Contact, EmailTemplate};

/// Rendered subject and bodies for one contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub subject: String,
    pub html_body: String,
    pub text_body: Option<String>,
}

/// Render a template's subject and bodies with the contact's variables.
pub fn render_template(template: &EmailTemplate, contact: &Contact) -> Rendered {
    let vars = contact.variables();

    let rendered = Rendered {
        subject: substitute(&template.subject, &vars),
        html_body: substitute(&template.html_body, &vars),
        text_body: template.text_body.as_deref().map(|t| substitute(t, &vars)),
    };

    debug!(
        template_id = %template.id,
        contact_id = %contact.id,
        subject_length = rendered.subject.len(),
        body_length = rendered.html_body.len(),
        "template_rendered"
    );

    rendered
}

/// Replace every `{{name}}` token with its variable value, or the empty
/// string when the variable is unknown. Text outside tokens is copied
/// verbatim; an unterminated `{{` is treated as literal text.
fn substitute(input: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        match after.find("}}") {
            Some(end) => {
                let name = after[..end].trim();
                if !name.is_empty() && is_identifier(name) {
                    if let Some(value) = vars.get(name) {
                        out.push_str(value);
                    }
                    // Unknown variables render as empty, never an error.
                } else {
                    // Not a variable token; keep the literal text.
                    out.push_str(&rest[start..start + 2 + end + 2]);
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }

    out.push_str(rest);
    out
}

fn is_identifier(name: &str) -> bool {
    name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SubscriptionStatus;
    use uuid::Uuid;

    fn contact() -> Contact {
        let mut fields = HashMap::new();
        fields.insert("company".to_string(), "Acme".to_string());
        Contact {
            id: Uuid::new_v4(),
            email: "ada@example.com".to_string(),
            first_name: Some("Ada".to_string()),
            last_name: Some("Lovelace".to_string()),
            fields,
            subscription_status: SubscriptionStatus::Subscribed,
        }
    }

    fn template(subject: &str, body: &str) -> EmailTemplate {
        EmailTemplate {
            id: Uuid::new_v4(),
            name: "t".to_string(),
            subject: subject.to_string(),
            html_body: body.to_string(),
            text_body: None,
        }
    }

    #[test]
    fn test_substitutes_known_variables() {
        let rendered = render_template(
            &template("Hi {{first_name}}", "<p>{{first_name}} {{last_name}} @ {{company}}</p>"),
            &contact(),
        );
        assert_eq!(rendered.subject, "Hi Ada");
        assert_eq!(rendered.html_body, "<p>Ada Lovelace @ Acme</p>");
    }

    #[test]
    fn test_missing_variable_renders_empty() {
        let rendered = render_template(
            &template("Hello {{nickname}}!", "<p>{{ nickname }}</p>"),
            &contact(),
        );
        assert_eq!(rendered.subject, "Hello !");
        assert_eq!(rendered.html_body, "<p></p>");
    }

    #[test]
    fn test_unterminated_braces_kept_literal() {
        let rendered = render_template(&template("Deal {{first_name", "body"), &contact());
        assert_eq!(rendered.subject, "Deal {{first_name");
    }

    #[test]
    fn test_non_identifier_token_kept_literal() {
        let rendered = render_template(&template("s", "css {{ a b }} rule"), &contact());
        assert_eq!(rendered.html_body, "css {{ a b }} rule");
    }

    #[test]
    fn test_text_body_rendered_when_present() {
        let mut t = template("s", "b");
        t.text_body = Some("Hi {{first_name}}".to_string());
        let rendered = render_template(&t, &contact());
        assert_eq!(rendered.text_body.as_deref(), Some("Hi Ada"));
    }
}
