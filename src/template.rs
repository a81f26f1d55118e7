//! Minimal evaluator for operator-configured token templates.
//!
//! Templates are plain text with `[var]` placeholders from a closed set:
//! `[uuid]`, `[container]`, `[random]` and `[config:KEY]`. Anything else is
//! rejected, so an admin-supplied template can never execute logic.

use rand::Rng;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, PartialEq)]
pub enum TemplateError {
    #[error("unknown template variable [{0}]")]
    UnknownVariable(String),
    #[error("unclosed [ in template")]
    Unclosed,
}

pub struct Context<'a> {
    /// the instance's unique suffix, reachable as `[container]`
    pub container: &'a str,
    /// operator-supplied extras, reachable as `[config:KEY]`
    pub vars: &'a HashMap<String, String>,
}

const RANDOM_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

pub fn random_token(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| RANDOM_ALPHABET[rng.gen_range(0..RANDOM_ALPHABET.len())] as char)
        .collect()
}

pub fn render(template: &str, ctx: &Context) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('[') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find(']').ok_or(TemplateError::Unclosed)?;
        let var = &after[..end];

        if var == "uuid" {
            out.push_str(&Uuid::new_v4().to_string());
        } else if var == "container" {
            out.push_str(ctx.container);
        } else if var == "random" {
            out.push_str(&random_token(8));
        } else if let Some(key) = var.strip_prefix("config:") {
            let value = ctx
                .vars
                .get(key)
                .ok_or_else(|| TemplateError::UnknownVariable(var.to_string()))?;
            out.push_str(value);
        } else {
            return Err(TemplateError::UnknownVariable(var.to_string()));
        }

        rest = &after[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(vars: &HashMap<String, String>) -> Context {
        Context {
            container: "c0ffee",
            vars,
        }
    }

    #[test]
    fn literal_text_passes_through() {
        let vars = HashMap::new();
        assert_eq!(render("flag{static}", &ctx(&vars)).unwrap(), "flag{static}");
    }

    #[test]
    fn substitutes_container_and_config() {
        let mut vars = HashMap::new();
        vars.insert("event".to_string(), "ctf24".to_string());
        let out = render("[config:event]{[container]}", &ctx(&vars)).unwrap();
        assert_eq!(out, "ctf24{c0ffee}");
    }

    #[test]
    fn uuid_is_fresh_per_render() {
        let vars = HashMap::new();
        let a = render("flag{[uuid]}", &ctx(&vars)).unwrap();
        let b = render("flag{[uuid]}", &ctx(&vars)).unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("flag{") && a.ends_with('}'));
    }

    #[test]
    fn rejects_unknown_variable() {
        let vars = HashMap::new();
        assert_eq!(
            render("flag{[env]}", &ctx(&vars)),
            Err(TemplateError::UnknownVariable("env".to_string()))
        );
    }

    #[test]
    fn rejects_unclosed_bracket() {
        let vars = HashMap::new();
        assert_eq!(render("flag{[uuid", &ctx(&vars)), Err(TemplateError::Unclosed));
    }

    #[test]
    fn random_token_alphabet_and_length() {
        let token = random_token(8);
        assert_eq!(token.len(), 8);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
