//! CLI argument handling
//!
//! `hone [config-path] [target]`: with one argument only the target is
//! set (the config stays `Honefile`); with two, both are set; with none,
//! the build runs `Honefile` against the `all` target.

use clap::Parser;
use std::path::PathBuf;

const DEFAULT_CONFIG: &str = "Honefile";
const DEFAULT_TARGET: &str = "all";

#[derive(Debug, Parser)]
#[command(
    name = "hone",
    about = "Container-native build tool with content-addressed caching",
    version
)]
pub struct Cli {
    /// Target to build, or the config path when a target follows
    pub first: Option<String>,

    /// Target to build
    pub second: Option<String>,
}

impl Cli {
    /// Resolve the positional arguments into (config path, target).
    pub fn config_and_target(&self) -> (PathBuf, String) {
        match (&self.first, &self.second) {
            (Some(config), Some(target)) => (PathBuf::from(config), target.clone()),
            (Some(target), None) => (PathBuf::from(DEFAULT_CONFIG), target.clone()),
            _ => (PathBuf::from(DEFAULT_CONFIG), DEFAULT_TARGET.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> (PathBuf, String) {
        Cli::parse_from(args).config_and_target()
    }

    #[test]
    fn test_no_args_defaults() {
        assert_eq!(
            parse(&["hone"]),
            (PathBuf::from("Honefile"), "all".to_string())
        );
    }

    #[test]
    fn test_one_arg_sets_target() {
        assert_eq!(
            parse(&["hone", "release"]),
            (PathBuf::from("Honefile"), "release".to_string())
        );
    }

    #[test]
    fn test_two_args_set_config_and_target() {
        assert_eq!(
            parse(&["hone", "ci/build.hone", "release"]),
            (PathBuf::from("ci/build.hone"), "release".to_string())
        );
    }
}
