//! Mints the per-instance secret token.
//!
//! `static` challenges are checked against the platform's manual flag, but
//! every instance still gets a syntactically valid token so `flag` is never
//! empty. `half_dynamic` keeps a fixed per-challenge prefix inside the
//! template's wrapper and randomizes an 8-character suffix.

use regex::Regex;
use std::str::FromStr;
use strum::{Display, EnumString};
use thiserror::Error;

use crate::config;
use crate::template::{self, Context, TemplateError};
use crate::types::Challenge;

#[derive(Debug, Clone, Copy, PartialEq, Display, EnumString)]
pub enum FlagMode {
    #[strum(serialize = "static")]
    Static,
    #[strum(serialize = "dynamic")]
    Dynamic,
    #[strum(serialize = "half_dynamic")]
    HalfDynamic,
}

impl FlagMode {
    /// Anything unrecognized behaves as `dynamic`, matching the fallback for
    /// a missing challenge record.
    pub fn parse(s: &str) -> Self {
        Self::from_str(s).unwrap_or(Self::Dynamic)
    }
}

#[derive(Error, Debug)]
pub enum FlagError {
    #[error("flag template error: {0}")]
    Template(#[from] TemplateError),
    #[error("flag template renders more than one {{...}} region")]
    AmbiguousWrapper,
}

pub fn generate(
    flags: &config::Flags,
    challenge: Option<&Challenge>,
    instance_uuid: &str,
) -> Result<String, FlagError> {
    let ctx = Context {
        container: instance_uuid,
        vars: &flags.vars,
    };

    let challenge = match challenge {
        Some(challenge) => challenge,
        // unknown challenge record: fall back to a plain dynamic token
        None => return Ok(template::render(&flags.template, &ctx)?),
    };

    match FlagMode::parse(&challenge.flag_mode) {
        // correctness is decided by the manual flag; this token only keeps
        // the instance record non-empty
        FlagMode::Static | FlagMode::Dynamic => Ok(template::render(&flags.template, &ctx)?),
        FlagMode::HalfDynamic => {
            let mut prefix = challenge.flag_static_prefix.clone();
            if !prefix.is_empty() && !prefix.ends_with('_') {
                prefix.push('_');
            }
            let payload = format!("{}{}", prefix, template::random_token(8));

            let rendered = template::render(&flags.template, &ctx)?;
            rewrap(&rendered, &payload)
        }
    }
}

/// Replaces the payload between the rendered template's single `{...}` pair.
///
/// No brace pair at all appends the payload verbatim; more than one pair is
/// ambiguous and rejected outright.
fn rewrap(rendered: &str, payload: &str) -> Result<String, FlagError> {
    let opening = rendered.matches('{').count();
    let closing = rendered.matches('}').count();

    if opening == 0 && closing == 0 {
        return Ok(format!("{rendered}{payload}"));
    }
    if opening != 1 || closing != 1 {
        return Err(FlagError::AmbiguousWrapper);
    }

    let wrapper = Regex::new(r"^([^{]*\{)([^}]*)(\}.*)$").unwrap();
    match wrapper.captures(rendered) {
        Some(caps) => Ok(format!("{}{}{}", &caps[1], payload, &caps[3])),
        // single braces in the wrong order ("}...{")
        None => Err(FlagError::AmbiguousWrapper),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn flags_config(template: &str) -> config::Flags {
        config::Flags {
            template: template.to_string(),
            vars: HashMap::new(),
        }
    }

    fn challenge(flag_mode: &str, prefix: &str) -> Challenge {
        Challenge {
            id: 1,
            name: "pwnable".to_string(),
            category: "pwn".to_string(),
            image: "registry.local/pwnable:latest".to_string(),
            memory_limit: "128m".to_string(),
            cpu_limit: 0.5,
            redirect_type: "direct".to_string(),
            redirect_port: 0,
            flag_mode: flag_mode.to_string(),
            flag_static_prefix: prefix.to_string(),
            manual_flag: None,
        }
    }

    #[test]
    fn half_dynamic_shares_wrapper_and_prefix_but_not_suffix() {
        let flags = flags_config("flag{[uuid]}");
        let chall = challenge("half_dynamic", "web");

        let a = generate(&flags, Some(&chall), "uuid-a").unwrap();
        let b = generate(&flags, Some(&chall), "uuid-b").unwrap();

        assert!(a.starts_with("flag{web_"));
        assert!(b.starts_with("flag{web_"));
        assert!(a.ends_with('}'));
        // wrapper + prefix identical, 8-char suffix differs
        assert_eq!(a.len(), "flag{web_}".len() + 8);
        assert_ne!(a, b);
    }

    #[test]
    fn half_dynamic_prefix_underscore_not_doubled() {
        let flags = flags_config("flag{[uuid]}");
        let chall = challenge("half_dynamic", "web_");

        let flag = generate(&flags, Some(&chall), "u").unwrap();
        assert!(flag.starts_with("flag{web_"));
        assert!(!flag.starts_with("flag{web__"));
    }

    #[test]
    fn half_dynamic_empty_prefix_is_just_random() {
        let flags = flags_config("flag{[uuid]}");
        let chall = challenge("half_dynamic", "");

        let flag = generate(&flags, Some(&chall), "u").unwrap();
        assert_eq!(flag.len(), "flag{}".len() + 8);
    }

    #[test]
    fn half_dynamic_keeps_wrapper_text_around_payload() {
        let flags = flags_config("CTF{[uuid]}_END");
        let chall = challenge("half_dynamic", "rev");

        let flag = generate(&flags, Some(&chall), "u").unwrap();
        assert!(flag.starts_with("CTF{rev_"));
        assert!(flag.ends_with("}_END"));
    }

    #[test]
    fn half_dynamic_without_braces_appends_payload() {
        let flags = flags_config("token-[container]-");
        let chall = challenge("half_dynamic", "misc");

        let flag = generate(&flags, Some(&chall), "abc").unwrap();
        assert!(flag.starts_with("token-abc-misc_"));
    }

    #[test]
    fn half_dynamic_multiple_brace_pairs_fail_closed() {
        let flags = flags_config("flag{a}{[uuid]}");
        let chall = challenge("half_dynamic", "web");

        assert!(matches!(
            generate(&flags, Some(&chall), "u"),
            Err(FlagError::AmbiguousWrapper)
        ));
    }

    #[test]
    fn dynamic_flags_are_unique() {
        let flags = flags_config("flag{[uuid]}");
        let chall = challenge("dynamic", "");

        let a = generate(&flags, Some(&chall), "u").unwrap();
        let b = generate(&flags, Some(&chall), "u").unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("flag{") && a.ends_with('}'));
    }

    #[test]
    fn static_mode_still_mints_a_valid_placeholder() {
        let flags = flags_config("flag{[uuid]}");
        let chall = challenge("static", "");

        let flag = generate(&flags, Some(&chall), "u").unwrap();
        assert!(flag.starts_with("flag{") && flag.ends_with('}'));
    }

    #[test]
    fn missing_challenge_falls_back_to_dynamic() {
        let flags = flags_config("flag{[uuid]}");
        let flag = generate(&flags, None, "u").unwrap();
        assert!(flag.starts_with("flag{") && flag.ends_with('}'));
    }

    #[test]
    fn unknown_mode_behaves_as_dynamic() {
        assert_eq!(FlagMode::parse("surprise"), FlagMode::Dynamic);
        assert_eq!(FlagMode::parse("half_dynamic"), FlagMode::HalfDynamic);
        assert_eq!(FlagMode::parse("static"), FlagMode::Static);
    }
}
