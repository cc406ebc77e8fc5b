//! Variable substitution engine
//!
//! Job string fields may reference the rendered build environment, loaded
//! secrets, and other jobs' declared outputs:
//!
//! - `${env.NAME}` - rendered build environment variable
//! - `${secrets.NAME}` - loaded secret
//! - `${jobs.NAME.output}` - first declared output of job NAME
//! - `${jobs.NAME.outputs[i]}` - i-th declared output of job NAME
//!
//! Every `jobs.NAME` reference is reported back to the caller so the parser
//! can merge an implicit dependency edge into the referencing job.

use crate::errors::{HoneError, Result};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;

/// Token pattern for substitution variables
static VARIABLE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([^}]+)\}").expect("variable pattern compiles"));

static OUTPUT_INDEX_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^outputs\[(\d+)\]$").expect("output index pattern compiles"));

/// Values available for substitution
#[derive(Debug, Default)]
pub struct SubstitutionContext {
    /// Rendered build environment (includes the injected git values)
    pub env: IndexMap<String, String>,
    /// Loaded secrets
    pub secrets: IndexMap<String, String>,
    /// Declared outputs of already-resolved jobs
    pub job_outputs: IndexMap<String, Vec<String>>,
}

/// Result of substituting one string
#[derive(Debug, Clone, PartialEq)]
pub struct Substituted {
    pub value: String,
    /// Names of jobs referenced through `${jobs.NAME...}` tokens
    pub job_refs: Vec<String>,
}

/// Scan a raw string for `${jobs.NAME...}` references without resolving
/// values. Used to discover implicit dependencies before resolution order
/// is known.
pub fn scan_job_refs(input: &str) -> Vec<String> {
    let mut refs = Vec::new();
    for capture in VARIABLE_PATTERN.captures_iter(input) {
        let token = &capture[1];
        if let Some(rest) = token.strip_prefix("jobs.") {
            if let Some((name, _)) = rest.split_once('.') {
                refs.push(name.to_string());
            }
        }
    }
    refs
}

fn resolve(token: &str, ctx: &SubstitutionContext) -> Result<(String, Option<String>)> {
    if let Some(name) = token.strip_prefix("env.") {
        let value = ctx.env.get(name).ok_or_else(|| {
            HoneError::config(format!("Unknown environment variable: ${{{token}}}"))
        })?;
        return Ok((value.clone(), None));
    }

    if let Some(name) = token.strip_prefix("secrets.") {
        let value = ctx
            .secrets
            .get(name)
            .ok_or_else(|| HoneError::config(format!("Unknown secret: ${{{token}}}")))?;
        return Ok((value.clone(), None));
    }

    if let Some(rest) = token.strip_prefix("jobs.") {
        let (name, field) = rest
            .split_once('.')
            .ok_or_else(|| HoneError::config(format!("Unknown variable: ${{{token}}}")))?;

        let outputs = ctx.job_outputs.get(name).ok_or_else(|| {
            HoneError::config(format!("Reference to unknown job: ${{{token}}}"))
        })?;

        let index = if field == "output" {
            0
        } else if let Some(capture) = OUTPUT_INDEX_PATTERN.captures(field) {
            capture[1]
                .parse::<usize>()
                .map_err(|e| HoneError::config(format!("Bad output index in ${{{token}}}: {e}")))?
        } else {
            return Err(HoneError::config(format!("Unknown variable: ${{{token}}}")));
        };

        let value = outputs.get(index).ok_or_else(|| {
            HoneError::config(format!(
                "Job {name} has no output {index} (referenced as ${{{token}}})"
            ))
        })?;

        return Ok((value.clone(), Some(name.to_string())));
    }

    Err(HoneError::config(format!("Unknown variable: ${{{token}}}")))
}

/// Replace every `${...}` token in a string, reporting referenced jobs.
pub fn substitute(input: &str, ctx: &SubstitutionContext) -> Result<Substituted> {
    let mut value = String::with_capacity(input.len());
    let mut job_refs = Vec::new();
    let mut last = 0;

    for capture in VARIABLE_PATTERN.captures_iter(input) {
        let whole = capture.get(0).expect("capture 0 always present");
        value.push_str(&input[last..whole.start()]);

        let (resolved, job_ref) = resolve(&capture[1], ctx)?;
        value.push_str(&resolved);
        if let Some(name) = job_ref {
            job_refs.push(name);
        }

        last = whole.end();
    }
    value.push_str(&input[last..]);

    Ok(Substituted { value, job_refs })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> SubstitutionContext {
        let mut ctx = SubstitutionContext::default();
        ctx.env.insert("GIT_BRANCH".to_string(), "main".to_string());
        ctx.secrets.insert("TOKEN".to_string(), "hunter2".to_string());
        ctx.job_outputs.insert(
            "compile".to_string(),
            vec!["bin/app".to_string(), "bin/app.dbg".to_string()],
        );
        ctx
    }

    #[test]
    fn test_env_substitution() {
        let out = substitute("branch is ${env.GIT_BRANCH}", &context()).unwrap();
        assert_eq!(out.value, "branch is main");
        assert!(out.job_refs.is_empty());
    }

    #[test]
    fn test_secret_substitution() {
        let out = substitute("${secrets.TOKEN}", &context()).unwrap();
        assert_eq!(out.value, "hunter2");
    }

    #[test]
    fn test_job_output_reference_adds_dep() {
        let out = substitute("cp ${jobs.compile.output} dist/", &context()).unwrap();
        assert_eq!(out.value, "cp bin/app dist/");
        assert_eq!(out.job_refs, vec!["compile"]);

        let out = substitute("ls ${jobs.compile.outputs[1]}", &context()).unwrap();
        assert_eq!(out.value, "ls bin/app.dbg");
        assert_eq!(out.job_refs, vec!["compile"]);
    }

    #[test]
    fn test_unknown_variable_is_config_error() {
        assert!(substitute("${env.NOPE}", &context()).is_err());
        assert!(substitute("${nonsense}", &context()).is_err());
        assert!(substitute("${jobs.compile.outputs[9]}", &context()).is_err());
    }

    #[test]
    fn test_scan_job_refs_without_resolution() {
        let refs = scan_job_refs("a ${jobs.compile.output} b ${jobs.lint.outputs[0]} ${env.X}");
        assert_eq!(refs, vec!["compile", "lint"]);
    }

    #[test]
    fn test_plain_strings_untouched() {
        let out = substitute("no tokens here", &context()).unwrap();
        assert_eq!(out.value, "no tokens here");
    }
}
