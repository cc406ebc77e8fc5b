//! Job fingerprinting
//!
//! A fingerprint is a SHA-256 digest over a job's declaration in canonical
//! form plus the bytes of every resolved input file. Declarations that
//! differ only in `deps` or `env` ordering digest identically; any byte of
//! any input flips the fingerprint.

use crate::errors::{HoneError, Result};
use crate::job::Job;
use globset::{Glob, GlobMatcher};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Declaration fields in fixed order with sets and maps sorted by key.
/// Runtime-only state and the engine override never appear here.
#[derive(Serialize)]
struct Declaration<'a> {
    name: &'a str,
    image: &'a Option<String>,
    shell: &'a Option<String>,
    exec: &'a Option<Vec<String>>,
    inputs: &'a [String],
    outputs: &'a [String],
    env: BTreeMap<&'a str, &'a str>,
    deps: &'a BTreeSet<String>,
    condition: &'a Option<String>,
    privileged: bool,
    workdir: &'a Option<String>,
    service: bool,
}

fn canonical_declaration(job: &Job) -> Result<Vec<u8>> {
    let decl = Declaration {
        name: &job.name,
        image: &job.image,
        shell: &job.shell,
        exec: &job.exec,
        inputs: &job.inputs,
        outputs: &job.outputs,
        env: job
            .env
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect(),
        deps: &job.deps,
        condition: &job.condition,
        privileged: job.privileged,
        workdir: &job.workdir,
        service: job.service,
    };

    serde_json::to_vec(&decl).map_err(|e| HoneError::cache(format!("encoding declaration: {e}")))
}

fn has_glob_meta(entry: &str) -> bool {
    entry.contains(['*', '?', '[', '{'])
}

/// Longest leading path prefix of a pattern with no glob metacharacters;
/// the walk for matches starts there.
fn glob_root(pattern: &str) -> PathBuf {
    let mut root = PathBuf::new();
    for component in Path::new(pattern).components() {
        if has_glob_meta(&component.as_os_str().to_string_lossy()) {
            break;
        }
        root.push(component);
    }
    if root.as_os_str().is_empty() {
        root.push(".");
    }
    root
}

fn glob_matches(pattern: &str) -> Result<Vec<PathBuf>> {
    let matcher: GlobMatcher = Glob::new(pattern)
        .map_err(|e| HoneError::cache(format!("invalid input glob {pattern}: {e}")))?
        .compile_matcher();

    let mut matches = Vec::new();
    for entry in WalkDir::new(glob_root(pattern))
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path().strip_prefix("./").unwrap_or(entry.path());
        if matcher.is_match(path) {
            matches.push(path.to_path_buf());
        }
    }

    matches.sort();
    Ok(matches)
}

/// Visit every file selected by a job's `inputs`, in declared entry order
/// with path-lexicographic ordering within an entry.
///
/// A literal path that does not exist is a hard error; a glob that matches
/// nothing is silently skipped. Directories recurse over regular files only.
pub fn walk_inputs<F>(job: &Job, mut visit: F) -> Result<()>
where
    F: FnMut(&Path) -> Result<()>,
{
    for input in &job.inputs {
        let path = Path::new(input);

        if path.is_file() {
            visit(path)?;
        } else if path.is_dir() {
            for entry in WalkDir::new(path)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if entry.file_type().is_file() {
                    visit(entry.path())?;
                }
            }
        } else if has_glob_meta(input) {
            for matched in glob_matches(input)? {
                visit(&matched)?;
            }
        } else {
            return Err(HoneError::cache(format!(
                "Job {}: input {} does not exist.",
                job.name, input
            )));
        }
    }

    Ok(())
}

/// All files selected by a job's inputs, in walk order.
pub fn collect_inputs(job: &Job) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    walk_inputs(job, |path| {
        paths.push(path.to_path_buf());
        Ok(())
    })?;
    Ok(paths)
}

/// Lowercase hex SHA-256 of a file's contents.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .map_err(|e| HoneError::cache(format!("opening {}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .map_err(|e| HoneError::cache(format!("hashing {}: {e}", path.display())))?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Fingerprint a job: canonical declaration, then every resolved input
/// file's bytes, digested into lowercase hex.
pub fn fingerprint(job: &Job) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(canonical_declaration(job)?);

    walk_inputs(job, |path| {
        let mut file = File::open(path)
            .map_err(|e| HoneError::cache(format!("opening input {}: {e}", path.display())))?;
        io::copy(&mut file, &mut hasher)
            .map_err(|e| HoneError::cache(format!("hashing input {}: {e}", path.display())))?;
        Ok(())
    })?;

    Ok(format!("{:x}", hasher.finalize()))
}
