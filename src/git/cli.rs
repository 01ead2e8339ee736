//! Git repository access through the `git` executable

use crate::error::{StrataError, StrataResult};
use crate::git::matcher::PathMatcher;
use crate::git::patch::{filter_patch, Archive, Patch};
use crate::git::{ArchiveOptions, GitRepository, PatchOptions};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Repository backed by a local work tree
pub struct CliGitRepository {
    work_tree: PathBuf,
}

const GITLINK_MODE: &str = "160000";
const SYMLINK_MODE: &str = "120000";
const EXECUTABLE_MODE: &str = "100755";

/// One blob or submodule entry of `git ls-tree -r`
struct TreeEntry {
    mode: String,
    object: String,
    path: String,
}

impl CliGitRepository {
    pub fn new(work_tree: impl Into<PathBuf>) -> Self {
        Self {
            work_tree: work_tree.into(),
        }
    }

    pub fn work_tree(&self) -> &Path {
        &self.work_tree
    }

    /// Execute a git command and return the raw output
    async fn exec(&self, args: &[&str]) -> StrataResult<std::process::Output> {
        debug!("Executing: git {:?}", args);

        Command::new("git")
            .arg("-C")
            .arg(&self.work_tree)
            .args(["-c", "core.quotepath=false"])
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| StrataError::command_failed(format!("git {:?}", args), e))
    }

    /// Execute a git command that must succeed and return its stdout
    async fn exec_ok(&self, args: &[&str]) -> StrataResult<Vec<u8>> {
        let output = self.exec(args).await?;
        if output.status.success() {
            return Ok(output.stdout);
        }
        Err(StrataError::GitCommand {
            command: format!("git {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Execute a git command that must succeed, feeding `input` on stdin
    async fn exec_with_input(&self, args: &[&str], input: Vec<u8>) -> StrataResult<Vec<u8>> {
        debug!("Executing: git {:?} with {} byte(s) of input", args, input.len());

        let mut child = Command::new("git")
            .arg("-C")
            .arg(&self.work_tree)
            .args(["-c", "core.quotepath=false"])
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| StrataError::command_failed(format!("git {:?}", args), e))?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            StrataError::command_failed(
                format!("git {:?}", args),
                std::io::Error::other("stdin was not captured"),
            )
        })?;
        let write = async move { stdin.write_all(&input).await };
        let (written, output) = tokio::join!(write, child.wait_with_output());
        let output = output.map_err(|e| StrataError::command_failed(format!("git {:?}", args), e))?;

        if !output.status.success() {
            return Err(StrataError::GitCommand {
                command: format!("git {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        written.map_err(|e| StrataError::command_failed(format!("git {:?}", args), e))?;
        Ok(output.stdout)
    }

    /// Entries of `commit` that belong to the mapping. `root` is where this
    /// repository sits in the top-level repository and prefixes every path.
    /// Submodules are kept when they may hold matching paths.
    async fn ls_tree(
        &self,
        commit: &str,
        root: &str,
        matcher: &PathMatcher,
    ) -> StrataResult<Vec<TreeEntry>> {
        let stdout = self
            .exec_ok(&["ls-tree", "-r", "-z", "--full-tree", commit])
            .await?;

        let entries = stdout
            .split(|b| *b == 0)
            .filter(|record| !record.is_empty())
            .filter_map(|record| parse_tree_entry(&String::from_utf8_lossy(record)))
            .map(|mut entry| {
                if !root.is_empty() {
                    entry.path = format!("{}/{}", root, entry.path);
                }
                entry
            })
            .filter(|entry| {
                if entry.is_submodule() {
                    matcher.may_contain(&entry.path)
                } else {
                    matcher.is_path_matched(&entry.path)
                }
            })
            .collect();

        Ok(entries)
    }

    /// Contents of `objects`, in order, read through `git cat-file --batch`
    async fn read_blobs(&self, objects: &[&str]) -> StrataResult<Vec<Vec<u8>>> {
        if objects.is_empty() {
            return Ok(Vec::new());
        }

        let mut input = objects.join("\n").into_bytes();
        input.push(b'\n');
        let stdout = self.exec_with_input(&["cat-file", "--batch"], input).await?;
        parse_batch_output(&stdout, objects.len())
    }

    /// Files of the mapping at `commit`, descending into submodules
    fn collect_files<'a>(
        &'a self,
        commit: &'a str,
        root: &'a str,
        matcher: &'a PathMatcher,
    ) -> BoxFuture<'a, StrataResult<Vec<ArchiveFile>>> {
        Box::pin(async move {
            let entries = self.ls_tree(commit, root, matcher).await?;
            let (submodules, blobs): (Vec<_>, Vec<_>) =
                entries.into_iter().partition(TreeEntry::is_submodule);

            let objects: Vec<&str> = blobs.iter().map(|e| e.object.as_str()).collect();
            let contents = self.read_blobs(&objects).await?;
            let mut files: Vec<ArchiveFile> = blobs
                .into_iter()
                .zip(contents)
                .map(|(entry, data)| ArchiveFile {
                    path: entry.path,
                    mode: entry.mode,
                    data,
                })
                .collect();

            for submodule in submodules {
                let local = match root {
                    "" => submodule.path.as_str(),
                    _ => submodule
                        .path
                        .strip_prefix(root)
                        .map(|p| p.trim_start_matches('/'))
                        .unwrap_or(submodule.path.as_str()),
                };
                let work_tree = self.work_tree.join(local);
                let checked_out = tokio::fs::try_exists(work_tree.join(".git"))
                    .await
                    .unwrap_or(false);
                if !checked_out {
                    return Err(StrataError::SubmoduleNotCheckedOut {
                        path: submodule.path,
                    });
                }

                debug!("Descending into submodule {} at {}", submodule.path, submodule.object);
                let nested = CliGitRepository::new(work_tree)
                    .collect_files(&submodule.object, &submodule.path, matcher)
                    .await?;
                files.extend(nested);
            }

            Ok(files)
        })
    }
}

impl TreeEntry {
    fn is_submodule(&self) -> bool {
        self.mode == GITLINK_MODE
    }
}

/// A file to be written into an archive
struct ArchiveFile {
    path: String,
    mode: String,
    data: Vec<u8>,
}

/// Split `git cat-file --batch` output into `expected` object contents
fn parse_batch_output(mut stdout: &[u8], expected: usize) -> StrataResult<Vec<Vec<u8>>> {
    let malformed = |reason: String| StrataError::GitCommand {
        command: "git cat-file --batch".to_string(),
        stderr: reason,
    };

    let mut contents = Vec::with_capacity(expected);
    while contents.len() < expected {
        let newline = stdout
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| malformed("truncated object header".to_string()))?;
        let header = String::from_utf8_lossy(&stdout[..newline]).to_string();
        let size: usize = header
            .rsplit(' ')
            .next()
            .and_then(|size| size.parse().ok())
            .ok_or_else(|| malformed(format!("unexpected object header {:?}", header)))?;

        let body = &stdout[newline + 1..];
        if body.len() < size {
            return Err(malformed(format!("object {:?} is truncated", header)));
        }
        contents.push(body[..size].to_vec());
        stdout = body[size..].strip_prefix(b"\n").unwrap_or(&body[size..]);
    }

    Ok(contents)
}

/// Tar stream of `files` with paths relative to the matcher's base. Parent
/// directories get their own entries; ownership and mtimes are zeroed.
fn build_tar(files: &[ArchiveFile], matcher: &PathMatcher) -> StrataResult<Vec<u8>> {
    let tar_error = |e: std::io::Error| StrataError::io("building git archive", e);
    let mut builder = tar::Builder::new(Vec::new());

    let relative: Vec<(&ArchiveFile, &str)> = files
        .iter()
        .filter_map(|file| matcher.trim_base(&file.path).map(|rel| (file, rel)))
        .filter(|(_, rel)| !rel.is_empty())
        .collect();

    let directories: BTreeSet<&str> = relative
        .iter()
        .flat_map(|&(_, rel)| rel.match_indices('/').map(move |(i, _)| &rel[..i]))
        .collect();
    for dir in directories {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(0o755);
        builder
            .append_data(&mut header, format!("{}/", dir), std::io::empty())
            .map_err(tar_error)?;
    }

    for (file, rel) in relative {
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);

        if file.mode == SYMLINK_MODE {
            let target = String::from_utf8_lossy(&file.data).to_string();
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            builder
                .append_link(&mut header, rel, target)
                .map_err(tar_error)?;
        } else {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(file.data.len() as u64);
            header.set_mode(if file.mode == EXECUTABLE_MODE { 0o755 } else { 0o644 });
            builder
                .append_data(&mut header, rel, file.data.as_slice())
                .map_err(tar_error)?;
        }
    }

    builder.into_inner().map_err(tar_error)
}

fn parse_tree_entry(record: &str) -> Option<TreeEntry> {
    let (meta, path) = record.split_once('\t')?;
    let mut fields = meta.split(' ');
    let mode = fields.next()?.to_string();
    let _kind = fields.next()?;
    let object = fields.next()?.to_string();
    Some(TreeEntry {
        mode,
        object,
        path: path.to_string(),
    })
}

#[async_trait]
impl GitRepository for CliGitRepository {
    async fn head_commit(&self) -> StrataResult<String> {
        let stdout = self.exec_ok(&["rev-parse", "HEAD"]).await?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }

    async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> StrataResult<bool> {
        let args = ["merge-base", "--is-ancestor", ancestor, descendant];
        let output = self.exec(&args).await?;

        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(StrataError::GitCommand {
                command: format!("git {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }

    async fn checksum(&self, commit: &str, matcher: &PathMatcher) -> StrataResult<String> {
        let entries = self.ls_tree(commit, "", matcher).await?;

        let mut hasher = Sha256::new();
        for entry in &entries {
            hasher.update(entry.path.as_bytes());
            hasher.update(b"\0");
            hasher.update(entry.mode.as_bytes());
            hasher.update(b"\0");
            hasher.update(entry.object.as_bytes());
            hasher.update(b"\n");
        }

        debug!(
            "Checksum of {} path(s) under {:?} at {}",
            entries.len(),
            matcher.base(),
            commit
        );
        Ok(hex::encode(hasher.finalize()))
    }

    async fn patch(&self, options: &PatchOptions) -> StrataResult<Patch> {
        let submodule = if options.with_submodules {
            "--submodule=diff"
        } else {
            "--ignore-submodules=all"
        };

        let mut args = vec![
            "diff",
            "--binary",
            "--full-index",
            "--no-renames",
            "--no-color",
            "--no-ext-diff",
            "--src-prefix=a/",
            "--dst-prefix=b/",
            submodule,
            options.from_commit.as_str(),
            options.to_commit.as_str(),
        ];
        if !options.matcher.base().is_empty() {
            args.push("--");
            args.push(options.matcher.base());
        }

        let raw = self.exec_ok(&args).await?;
        let patch = filter_patch(&raw, &options.matcher);

        debug!(
            "Patch {}..{} under {:?}: {} path(s), {} binary",
            options.from_commit,
            options.to_commit,
            options.matcher.base(),
            patch.paths.len(),
            patch.binary_paths.len()
        );
        Ok(patch)
    }

    async fn archive(&self, options: &ArchiveOptions) -> StrataResult<Archive> {
        let mut files = self
            .collect_files(&options.commit, "", &options.matcher)
            .await?;
        files.sort_by(|a, b| a.path.cmp(&b.path));

        let content = if files.is_empty() {
            Vec::new()
        } else {
            build_tar(&files, &options.matcher)?
        };

        debug!(
            "Archive of {} path(s) under {:?} at {}",
            files.len(),
            options.matcher.base(),
            options.commit
        );
        Ok(Archive {
            commit: options.commit.clone(),
            content,
            paths: files.into_iter().map(|f| f.path).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_ls_tree_records() {
        let entry =
            parse_tree_entry("100644 blob 1111111111111111111111111111111111111111\tsrc/main.rs")
                .unwrap();
        assert_eq!(entry.mode, "100644");
        assert_eq!(entry.object, "1111111111111111111111111111111111111111");
        assert_eq!(entry.path, "src/main.rs");

        assert!(parse_tree_entry("garbage").is_none());
    }

    #[test]
    fn splits_batch_output_by_declared_size() {
        let stdout = b"aaaa blob 6\nline\n\n\nbbbb blob 0\n\ncccc blob 2\nhi\n";
        let contents = parse_batch_output(stdout, 3).unwrap();
        assert_eq!(contents, vec![b"line\n\n".to_vec(), Vec::new(), b"hi".to_vec()]);

        let err = parse_batch_output(b"aaaa missing\n", 1).unwrap_err();
        assert!(err.to_string().contains("aaaa missing"));
        assert!(parse_batch_output(b"aaaa blob 10\nshort\n", 1).is_err());
    }

    /// Entry paths, types and contents of a tar stream
    fn tar_entries(content: &[u8]) -> Vec<(String, tar::EntryType, Vec<u8>)> {
        use std::io::Read;

        let mut archive = tar::Archive::new(content);
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let path = entry.path().unwrap().to_string_lossy().to_string();
                let kind = entry.header().entry_type();
                let mut data = Vec::new();
                if kind == tar::EntryType::Symlink {
                    let target = entry.link_name().unwrap().unwrap();
                    data = target.to_string_lossy().as_bytes().to_vec();
                } else {
                    entry.read_to_end(&mut data).unwrap();
                }
                (path.trim_end_matches('/').to_string(), kind, data)
            })
            .collect()
    }

    fn file(path: &str, mode: &str, data: &[u8]) -> ArchiveFile {
        ArchiveFile {
            path: path.to_string(),
            mode: mode.to_string(),
            data: data.to_vec(),
        }
    }

    #[test]
    fn tar_is_rebased_with_parent_directories() {
        let files = vec![
            file("app/bin/run", EXECUTABLE_MODE, b"#!/bin/sh\n"),
            file("app/current", SYMLINK_MODE, b"bin/run"),
            file("app/lib/deep/x.txt", "100644", b"x"),
        ];
        let content = build_tar(&files, &PathMatcher::all_under("app").unwrap()).unwrap();
        let entries = tar_entries(&content);

        let names: Vec<&str> = entries.iter().map(|(p, _, _)| p.as_str()).collect();
        assert_eq!(names, vec!["bin", "lib", "lib/deep", "bin/run", "current", "lib/deep/x.txt"]);
        assert_eq!(entries[0].1, tar::EntryType::Directory);
        assert_eq!(entries[4].1, tar::EntryType::Symlink);
        assert_eq!(entries[4].2, b"bin/run");

        let mut archive = tar::Archive::new(content.as_slice());
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            let header = entry.header();
            assert_eq!(header.mtime().unwrap(), 0);
            assert_eq!(header.uid().unwrap(), 0);
            if entry.path().unwrap().ends_with("run") {
                assert_eq!(header.mode().unwrap(), 0o755);
            }
        }
    }

    async fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn commit_all(repo: &CliGitRepository, message: &str) -> String {
        repo.exec_ok(&["add", "-A"]).await.unwrap();
        repo.exec_ok(&[
            "-c",
            "user.name=strata",
            "-c",
            "user.email=strata@example.com",
            "commit",
            "-q",
            "-m",
            message,
        ])
        .await
        .unwrap();
        repo.head_commit().await.unwrap()
    }

    #[tokio::test]
    async fn patch_and_checksum_against_real_repository() {
        if !git_available().await {
            return;
        }

        let dir = TempDir::new().unwrap();
        let repo = CliGitRepository::new(dir.path());
        repo.exec_ok(&["init", "-q"]).await.unwrap();

        std::fs::create_dir_all(dir.path().join("app")).unwrap();
        std::fs::write(dir.path().join("app/main.txt"), "one\n").unwrap();
        std::fs::write(dir.path().join("README"), "readme\n").unwrap();
        let first = commit_all(&repo, "first").await;

        std::fs::write(dir.path().join("app/main.txt"), "two\n").unwrap();
        std::fs::write(dir.path().join("app/blob.bin"), [0u8, 159, 146, 150]).unwrap();
        std::fs::write(dir.path().join("README"), "changed\n").unwrap();
        let second = commit_all(&repo, "second").await;

        assert!(repo.is_ancestor(&first, &second).await.unwrap());
        assert!(!repo.is_ancestor(&second, &first).await.unwrap());

        let matcher = PathMatcher::all_under("app").unwrap();
        let patch = repo
            .patch(&PatchOptions {
                from_commit: first.clone(),
                to_commit: second.clone(),
                matcher: matcher.clone(),
                with_submodules: true,
            })
            .await
            .unwrap();

        assert_eq!(patch.paths, vec!["app/blob.bin", "app/main.txt"]);
        assert_eq!(patch.binary_paths, vec!["app/blob.bin"]);
        let text = String::from_utf8_lossy(&patch.content);
        assert!(text.contains("diff --git a/main.txt b/main.txt"));

        let before = repo.checksum(&first, &matcher).await.unwrap();
        let after = repo.checksum(&second, &matcher).await.unwrap();
        assert_ne!(before, after);

        let readme_only = PathMatcher::new("", &["README".to_string()], &[]).unwrap();
        let docs_first = repo.checksum(&first, &readme_only).await.unwrap();
        assert_eq!(docs_first, repo.checksum(&first, &readme_only).await.unwrap());

        let archive = repo
            .archive(&ArchiveOptions {
                commit: second,
                matcher,
            })
            .await
            .unwrap();
        assert_eq!(archive.paths, vec!["app/blob.bin", "app/main.txt"]);
        assert!(!archive.content.is_empty());
    }

    #[tokio::test]
    async fn archive_of_a_wide_tree_does_not_list_paths_on_the_command_line() {
        if !git_available().await {
            return;
        }

        let dir = TempDir::new().unwrap();
        let repo = CliGitRepository::new(dir.path());
        repo.exec_ok(&["init", "-q"]).await.unwrap();

        // Enough long paths to exceed the kernel's argument size limit
        let deep = dir.path().join("src").join("d".repeat(100));
        std::fs::create_dir_all(&deep).unwrap();
        for i in 0..12_000 {
            std::fs::write(deep.join(format!("f{:05}-{}", i, "x".repeat(100))), "x").unwrap();
        }
        std::fs::write(dir.path().join("src/skip.log"), "log").unwrap();
        let commit = commit_all(&repo, "wide").await;

        let matcher = PathMatcher::new("src", &[], &["*.log".to_string()]).unwrap();
        let archive = repo
            .archive(&ArchiveOptions { commit, matcher })
            .await
            .unwrap();

        assert_eq!(archive.paths.len(), 12_000);
        assert!(!archive.paths.iter().any(|p| p.ends_with(".log")));
        let files = tar_entries(&archive.content)
            .into_iter()
            .filter(|(_, kind, _)| *kind == tar::EntryType::Regular)
            .count();
        assert_eq!(files, 12_000);
    }

    #[tokio::test]
    async fn submodule_contents_are_archived_and_patched() {
        if !git_available().await {
            return;
        }

        let dir = TempDir::new().unwrap();
        let upstream_dir = dir.path().join("upstream");
        let work_dir = dir.path().join("work");
        std::fs::create_dir_all(upstream_dir.join("src")).unwrap();
        std::fs::create_dir_all(work_dir.join("app")).unwrap();

        let upstream = CliGitRepository::new(&upstream_dir);
        upstream.exec_ok(&["init", "-q"]).await.unwrap();
        std::fs::write(upstream_dir.join("src/util.txt"), "v1\n").unwrap();
        commit_all(&upstream, "lib").await;

        let repo = CliGitRepository::new(&work_dir);
        repo.exec_ok(&["init", "-q"]).await.unwrap();
        std::fs::write(work_dir.join("app/main.txt"), "main\n").unwrap();
        let upstream_url = upstream_dir.to_string_lossy().to_string();
        repo.exec_ok(&[
            "-c",
            "protocol.file.allow=always",
            "submodule",
            "add",
            "-q",
            upstream_url.as_str(),
            "vendor/lib",
        ])
        .await
        .unwrap();
        let first = commit_all(&repo, "with submodule").await;

        let everything = PathMatcher::all_under("").unwrap();
        let archive = repo
            .archive(&ArchiveOptions {
                commit: first.clone(),
                matcher: everything.clone(),
            })
            .await
            .unwrap();
        assert_eq!(
            archive.paths,
            vec![".gitmodules", "app/main.txt", "vendor/lib/src/util.txt"]
        );
        let util = tar_entries(&archive.content)
            .into_iter()
            .find(|(path, _, _)| path == "vendor/lib/src/util.txt")
            .unwrap();
        assert_eq!(util.2, b"v1\n");

        let inside = PathMatcher::all_under("vendor/lib/src").unwrap();
        let scoped = repo
            .archive(&ArchiveOptions {
                commit: first.clone(),
                matcher: inside.clone(),
            })
            .await
            .unwrap();
        assert_eq!(scoped.paths, vec!["vendor/lib/src/util.txt"]);
        let names: Vec<String> = tar_entries(&scoped.content).into_iter().map(|e| e.0).collect();
        assert_eq!(names, vec!["util.txt"]);

        let checkout = CliGitRepository::new(work_dir.join("vendor/lib"));
        std::fs::write(work_dir.join("vendor/lib/src/util.txt"), "v2\n").unwrap();
        commit_all(&checkout, "bump").await;
        let second = commit_all(&repo, "bump submodule").await;

        assert_ne!(
            repo.checksum(&first, &inside).await.unwrap(),
            repo.checksum(&second, &inside).await.unwrap()
        );

        let patch = repo
            .patch(&PatchOptions {
                from_commit: first.clone(),
                to_commit: second.clone(),
                matcher: everything.clone(),
                with_submodules: true,
            })
            .await
            .unwrap();
        assert_eq!(patch.paths, vec!["vendor/lib/src/util.txt"]);
        let text = String::from_utf8_lossy(&patch.content);
        assert!(text.contains("+v2"));

        std::fs::remove_dir_all(work_dir.join("vendor/lib")).unwrap();
        let err = repo
            .archive(&ArchiveOptions {
                commit: second,
                matcher: everything,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::SubmoduleNotCheckedOut { ref path } if path == "vendor/lib"));
    }
}
