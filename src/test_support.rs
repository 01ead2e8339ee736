//! In-memory registry, runtime and git fakes shared by unit tests

use crate::error::{RegistryErrorCode, StrataError, StrataResult};
use crate::git::patch::filter_patch;
use crate::git::{Archive, ArchiveOptions, GitRepository, Patch, PatchOptions, PathMatcher};
use crate::image::BuiltImage;
use crate::orchestration::{ContainerRuntime, LayerSpec};
use crate::registry::api::{
    content_digest, ManifestResponse, MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_OCI_INDEX,
};
use crate::registry::{Credentials, Reference, RegistryApi};
use async_trait::async_trait;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Log output of the current thread, captured while this value is alive
pub(crate) struct CapturedLogs {
    buffer: Arc<Mutex<Vec<u8>>>,
    _guard: tracing::subscriber::DefaultGuard,
}

impl CapturedLogs {
    pub fn start() -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let writer = LogWriter(buffer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        Self {
            buffer,
            _guard: tracing::subscriber::set_default(subscriber),
        }
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).to_string()
    }

    /// Captured lines at `level` (e.g. "WARN")
    pub fn lines_at(&self, level: &str) -> Vec<String> {
        self.contents()
            .lines()
            .filter(|line| line.split_whitespace().nth(1) == Some(level))
            .map(str::to_string)
            .collect()
    }
}

#[derive(Clone)]
struct LogWriter(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Result of pushing an image into `MemoryRegistry`
#[derive(Debug, Clone)]
pub(crate) struct PushedImage {
    pub id: String,
    pub digest: String,
}

/// Behavior of `delete_manifest_scoped`
#[derive(Debug, Clone)]
pub(crate) enum ScopedDelete {
    Succeed,
    Fail(RegistryErrorCode),
}

#[derive(Default)]
struct Repo {
    /// tag -> manifest digest
    tags: BTreeMap<String, String>,
    /// digest -> (media type, body)
    manifests: HashMap<String, (String, Vec<u8>)>,
    blobs: HashMap<String, Vec<u8>>,
}

impl Repo {
    fn resolve(&self, reference: &Reference) -> Option<String> {
        match reference.digest() {
            Some(digest) => Some(digest.to_string()),
            None => self.tags.get(reference.identifier()).cloned(),
        }
    }

    fn remove_manifest(&mut self, digest: &str) -> bool {
        if self.manifests.remove(digest).is_none() {
            return false;
        }
        self.tags.retain(|_, d| d != digest);
        true
    }
}

struct RegistryState {
    repos: HashMap<String, Repo>,
    fail_manifest_reads: Option<RegistryErrorCode>,
    fail_list: HashMap<String, RegistryErrorCode>,
    fail_delete: HashSet<String>,
    deny_generic_delete: bool,
    scoped_delete: ScopedDelete,
    scoped_delete_calls: usize,
    last_scope: Option<String>,
    delete_calls: usize,
}

/// Docker Registry v2 semantics over hash maps
pub(crate) struct MemoryRegistry {
    state: Mutex<RegistryState>,
}

fn repo_key(reference: &str) -> String {
    Reference::parse(reference)
        .map(|r| r.repository_str())
        .unwrap_or_else(|_| reference.to_string())
}

fn status_of(code: &RegistryErrorCode) -> u16 {
    match code {
        RegistryErrorCode::NameUnknown
        | RegistryErrorCode::ManifestUnknown
        | RegistryErrorCode::BlobUnknown => 404,
        RegistryErrorCode::Unauthorized => 401,
        RegistryErrorCode::Denied => 403,
        RegistryErrorCode::Unsupported => 405,
        RegistryErrorCode::Other(_) => 400,
    }
}

fn error(reference: &Reference, code: RegistryErrorCode, message: &str) -> StrataError {
    let status = status_of(&code);
    StrataError::registry(reference.to_string(), code, status, message)
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                repos: HashMap::new(),
                fail_manifest_reads: None,
                fail_list: HashMap::new(),
                fail_delete: HashSet::new(),
                deny_generic_delete: false,
                scoped_delete: ScopedDelete::Succeed,
                scoped_delete_calls: 0,
                last_scope: None,
                delete_calls: 0,
            }),
        }
    }

    /// Push an image whose id is the digest of its config
    pub fn put_image(
        &self,
        repo: &str,
        tag: &str,
        parent: Option<&str>,
        labels: Vec<(String, String)>,
    ) -> PushedImage {
        let labels: BTreeMap<String, String> = labels.into_iter().collect();
        let config = config_body(parent, &labels);
        let id = content_digest(&config);
        self.store(repo, tag, &id, config)
    }

    /// Push an image under a given id
    pub fn put_image_with_id(
        &self,
        repo: &str,
        tag: &str,
        id: &str,
        parent: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> PushedImage {
        self.store(repo, tag, id, config_body(parent, labels))
    }

    fn store(&self, repo: &str, tag: &str, id: &str, config: Vec<u8>) -> PushedImage {
        let manifest = json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_DOCKER_MANIFEST,
            "config": {
                "mediaType": "application/vnd.docker.container.image.v1+json",
                "digest": id,
                "size": config.len(),
            },
            "layers": [],
        })
        .to_string()
        .into_bytes();
        let digest = content_digest(&manifest);

        let mut state = self.state.lock().unwrap();
        let entry = state.repos.entry(repo_key(repo)).or_default();
        entry.blobs.insert(id.to_string(), config);
        entry
            .manifests
            .insert(digest.clone(), (MEDIA_TYPE_DOCKER_MANIFEST.to_string(), manifest));
        entry.tags.insert(tag.to_string(), digest.clone());

        PushedImage {
            id: id.to_string(),
            digest,
        }
    }

    /// Tag an OCI index over `(digest, architecture)` entries
    pub fn put_index(&self, repo: &str, tag: &str, entries: &[(&str, &str)]) {
        let manifests: Vec<_> = entries
            .iter()
            .map(|(digest, arch)| {
                json!({
                    "mediaType": MEDIA_TYPE_DOCKER_MANIFEST,
                    "digest": digest,
                    "platform": {"architecture": arch, "os": "linux"},
                })
            })
            .collect();
        let body = json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI_INDEX,
            "manifests": manifests,
        })
        .to_string()
        .into_bytes();
        let digest = content_digest(&body);

        let mut state = self.state.lock().unwrap();
        let entry = state.repos.entry(repo_key(repo)).or_default();
        entry
            .manifests
            .insert(digest.clone(), (MEDIA_TYPE_OCI_INDEX.to_string(), body));
        entry.tags.insert(tag.to_string(), digest);
    }

    /// Drop the config blob behind `tag`
    pub fn break_blob(&self, repo: &str, tag: &str) {
        let mut state = self.state.lock().unwrap();
        let entry = state.repos.entry(repo_key(repo)).or_default();
        let config_digest = entry
            .tags
            .get(tag)
            .and_then(|digest| entry.manifests.get(digest))
            .and_then(|(_, body)| serde_json::from_slice::<serde_json::Value>(body).ok())
            .and_then(|doc| doc["config"]["digest"].as_str().map(str::to_string));
        if let Some(config_digest) = config_digest {
            entry.blobs.remove(&config_digest);
        }
    }

    /// A tag pointing at a manifest that does not exist
    pub fn put_dangling_tag(&self, repo: &str, tag: &str) {
        let mut state = self.state.lock().unwrap();
        let entry = state.repos.entry(repo_key(repo)).or_default();
        entry
            .tags
            .insert(tag.to_string(), content_digest(tag.as_bytes()));
    }

    pub fn fail_manifest_reads(&self, code: RegistryErrorCode) {
        self.state.lock().unwrap().fail_manifest_reads = Some(code);
    }

    pub fn fail_list(&self, repo: &str, code: RegistryErrorCode) {
        self.state
            .lock()
            .unwrap()
            .fail_list
            .insert(repo_key(repo), code);
    }

    /// Make generic deletes of `tag` fail with `DENIED`
    pub fn fail_delete(&self, tag: &str) {
        self.state.lock().unwrap().fail_delete.insert(tag.to_string());
    }

    pub fn deny_generic_delete(&self) {
        self.state.lock().unwrap().deny_generic_delete = true;
    }

    pub fn set_scoped_delete(&self, behavior: ScopedDelete) {
        self.state.lock().unwrap().scoped_delete = behavior;
    }

    pub fn scoped_delete_calls(&self) -> usize {
        self.state.lock().unwrap().scoped_delete_calls
    }

    pub fn last_scope(&self) -> Option<String> {
        self.state.lock().unwrap().last_scope.clone()
    }

    /// Generic delete requests received
    pub fn delete_calls(&self) -> usize {
        self.state.lock().unwrap().delete_calls
    }

    /// Sorted tags of a repository
    pub fn tags(&self, repo: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .repos
            .get(&repo_key(repo))
            .map(|r| r.tags.keys().cloned().collect())
            .unwrap_or_default()
    }
}

fn config_body(parent: Option<&str>, labels: &BTreeMap<String, String>) -> Vec<u8> {
    json!({
        "architecture": "amd64",
        "os": "linux",
        "config": {
            "Labels": labels,
            "Image": parent.unwrap_or_default(),
        },
    })
    .to_string()
    .into_bytes()
}

#[async_trait]
impl RegistryApi for MemoryRegistry {
    async fn list_tags(&self, repository: &Reference) -> StrataResult<Vec<String>> {
        let state = self.state.lock().unwrap();
        let key = repository.repository_str();
        if let Some(code) = state.fail_list.get(&key) {
            return Err(error(repository, code.clone(), "listing failed"));
        }
        state
            .repos
            .get(&key)
            .map(|r| r.tags.keys().cloned().collect())
            .ok_or_else(|| error(repository, RegistryErrorCode::NameUnknown, "repository name not known"))
    }

    async fn get_manifest(&self, reference: &Reference) -> StrataResult<ManifestResponse> {
        let state = self.state.lock().unwrap();
        if let Some(code) = &state.fail_manifest_reads {
            return Err(error(reference, code.clone(), "manifest read failed"));
        }
        let repo = state
            .repos
            .get(&reference.repository_str())
            .ok_or_else(|| error(reference, RegistryErrorCode::NameUnknown, "repository name not known"))?;

        let unknown = || error(reference, RegistryErrorCode::ManifestUnknown, "manifest unknown");
        let digest = repo.resolve(reference).ok_or_else(unknown)?;
        let (media_type, body) = repo.manifests.get(&digest).ok_or_else(unknown)?;
        Ok(ManifestResponse {
            digest,
            media_type: Some(media_type.clone()),
            body: body.clone(),
        })
    }

    async fn get_blob(&self, repository: &Reference, digest: &str) -> StrataResult<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state
            .repos
            .get(&repository.repository_str())
            .and_then(|r| r.blobs.get(digest))
            .cloned()
            .ok_or_else(|| error(repository, RegistryErrorCode::BlobUnknown, "blob unknown"))
    }

    async fn delete_manifest(&self, reference: &Reference) -> StrataResult<()> {
        let mut state = self.state.lock().unwrap();
        state.delete_calls += 1;
        if state.deny_generic_delete {
            return Err(error(reference, RegistryErrorCode::Unauthorized, "generic delete denied"));
        }
        if reference
            .tag()
            .is_some_and(|tag| state.fail_delete.contains(tag))
        {
            return Err(error(reference, RegistryErrorCode::Denied, "delete rejected"));
        }

        let unknown = || error(reference, RegistryErrorCode::ManifestUnknown, "manifest unknown");
        let repo = state
            .repos
            .get_mut(&reference.repository_str())
            .ok_or_else(unknown)?;
        let digest = repo.resolve(reference).ok_or_else(unknown)?;
        if repo.remove_manifest(&digest) {
            Ok(())
        } else {
            Err(unknown())
        }
    }

    async fn delete_manifest_scoped(
        &self,
        reference: &Reference,
        _credentials: &Credentials,
        scope: &str,
    ) -> StrataResult<()> {
        let mut state = self.state.lock().unwrap();
        state.scoped_delete_calls += 1;
        state.last_scope = Some(scope.to_string());
        if let ScopedDelete::Fail(code) = &state.scoped_delete {
            let code = code.clone();
            return Err(error(reference, code, "scoped delete failed"));
        }

        let unknown = || error(reference, RegistryErrorCode::ManifestUnknown, "manifest unknown");
        let repo = state
            .repos
            .get_mut(&reference.repository_str())
            .ok_or_else(unknown)?;
        let digest = repo.resolve(reference).ok_or_else(unknown)?;
        if repo.remove_manifest(&digest) {
            Ok(())
        } else {
            Err(unknown())
        }
    }
}

#[derive(Default)]
struct RuntimeState {
    layers: Vec<LayerSpec>,
    tags: Vec<(String, String)>,
    fail_patches: bool,
}

/// Container runtime producing deterministic image ids, pushing into a `MemoryRegistry`
pub(crate) struct FakeRuntime {
    registry: Arc<MemoryRegistry>,
    state: Mutex<RuntimeState>,
}

impl FakeRuntime {
    pub fn new(registry: Arc<MemoryRegistry>) -> Self {
        Self {
            registry,
            state: Mutex::new(RuntimeState::default()),
        }
    }

    /// Layers built so far, oldest first
    pub fn layers(&self) -> Vec<LayerSpec> {
        self.state.lock().unwrap().layers.clone()
    }

    /// `(image id, name)` pairs passed to `tag`
    pub fn tags(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().tags.clone()
    }

    /// Make every layer carrying patches fail to apply
    pub fn fail_patches(&self, fail: bool) {
        self.state.lock().unwrap().fail_patches = fail;
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn pull(&self, reference: &str) -> StrataResult<BuiltImage> {
        Ok(BuiltImage {
            name: reference.to_string(),
            id: content_digest(format!("base {}", reference).as_bytes()),
            parent_id: None,
            labels: BTreeMap::new(),
        })
    }

    async fn build_layer(&self, spec: &LayerSpec) -> StrataResult<BuiltImage> {
        let mut state = self.state.lock().unwrap();
        if state.fail_patches {
            if let Some(layer) = spec.patches.first() {
                return Err(StrataError::Patch {
                    add: String::new(),
                    to: layer.to.clone(),
                    reason: "patch does not apply".to_string(),
                });
            }
        }

        let mut labels = spec.from.labels.clone();
        labels.extend(spec.labels.clone());

        let mut hasher = Sha256::new();
        hasher.update(spec.from.id.as_bytes());
        for (key, value) in &labels {
            hasher.update(format!("label {}={}\0", key, value).as_bytes());
        }
        for command in &spec.commands {
            hasher.update(format!("run {}\0", command).as_bytes());
        }
        for import in &spec.imports {
            hasher.update(format!("import {} {} {}\0", import.image_id, import.add, import.to).as_bytes());
        }
        for archive in &spec.archives {
            hasher.update(archive.to.as_bytes());
            hasher.update(&archive.archive.content);
        }
        for patch in &spec.patches {
            hasher.update(patch.to.as_bytes());
            hasher.update(&patch.patch.content);
        }

        state.layers.push(spec.clone());
        Ok(BuiltImage {
            name: spec.name.clone(),
            id: format!("sha256:{}", hex::encode(hasher.finalize())),
            parent_id: Some(spec.from.id.clone()),
            labels,
        })
    }

    async fn push(&self, image: &BuiltImage, reference: &str) -> StrataResult<BuiltImage> {
        let parsed = Reference::parse(reference)?;
        self.registry.put_image_with_id(
            &parsed.repository_str(),
            parsed.identifier(),
            &image.id,
            image.parent_id.as_deref(),
            &image.labels,
        );
        Ok(BuiltImage {
            name: reference.to_string(),
            ..image.clone()
        })
    }

    async fn tag(&self, image: &BuiltImage, name: &str) -> StrataResult<()> {
        self.state
            .lock()
            .unwrap()
            .tags
            .push((image.id.clone(), name.to_string()));
        Ok(())
    }

    fn runtime_name(&self) -> &'static str {
        "fake"
    }
}

#[derive(Default)]
struct GitState {
    /// Linear history, oldest first
    commits: Vec<(String, BTreeMap<String, String>)>,
    head: Option<String>,
    patch_calls: usize,
}

/// Linear in-memory git history
#[derive(Default)]
pub(crate) struct FakeGit {
    state: Mutex<GitState>,
}

impl FakeGit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a commit with the given tree and check it out
    pub fn commit(&self, id: &str, files: &[(&str, &str)]) {
        let tree = files
            .iter()
            .map(|(path, content)| (path.to_string(), content.to_string()))
            .collect();
        let mut state = self.state.lock().unwrap();
        state.commits.push((id.to_string(), tree));
        state.head = Some(id.to_string());
    }

    pub fn checkout(&self, id: &str) {
        self.state.lock().unwrap().head = Some(id.to_string());
    }

    pub fn patch_calls(&self) -> usize {
        self.state.lock().unwrap().patch_calls
    }

    fn position(state: &GitState, commit: &str) -> StrataResult<usize> {
        state
            .commits
            .iter()
            .position(|(id, _)| id == commit)
            .ok_or_else(|| StrataError::GitCommand {
                command: format!("git rev-parse {}", commit),
                stderr: "unknown revision".to_string(),
            })
    }

    fn tree(state: &GitState, commit: &str) -> StrataResult<BTreeMap<String, String>> {
        let position = Self::position(state, commit)?;
        Ok(state.commits[position].1.clone())
    }

    fn matched(tree: &BTreeMap<String, String>, matcher: &PathMatcher) -> Vec<(String, String)> {
        tree.iter()
            .filter(|(path, _)| matcher.is_path_matched(path))
            .map(|(path, content)| (path.clone(), content.clone()))
            .collect()
    }
}

#[async_trait]
impl GitRepository for FakeGit {
    async fn head_commit(&self) -> StrataResult<String> {
        self.state
            .lock()
            .unwrap()
            .head
            .clone()
            .ok_or_else(|| StrataError::GitCommand {
                command: "git rev-parse HEAD".to_string(),
                stderr: "no commits yet".to_string(),
            })
    }

    async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> StrataResult<bool> {
        let state = self.state.lock().unwrap();
        Ok(Self::position(&state, ancestor)? <= Self::position(&state, descendant)?)
    }

    async fn checksum(&self, commit: &str, matcher: &PathMatcher) -> StrataResult<String> {
        let state = self.state.lock().unwrap();
        let tree = Self::tree(&state, commit)?;
        let mut hasher = Sha256::new();
        for (path, content) in Self::matched(&tree, matcher) {
            hasher.update(format!("{}\0{}\0", path, content).as_bytes());
        }
        Ok(hex::encode(hasher.finalize()))
    }

    async fn patch(&self, options: &PatchOptions) -> StrataResult<Patch> {
        let mut state = self.state.lock().unwrap();
        state.patch_calls += 1;
        let from = Self::tree(&state, &options.from_commit)?;
        let to = Self::tree(&state, &options.to_commit)?;

        let paths: BTreeSet<&String> = from.keys().chain(to.keys()).collect();
        let mut raw = String::new();
        for path in paths {
            let (old, new) = (from.get(path), to.get(path));
            if old == new {
                continue;
            }
            raw.push_str(&format!("diff --git a/{path} b/{path}\n--- a/{path}\n+++ b/{path}\n@@ -1 +1 @@\n"));
            if let Some(old) = old {
                raw.push_str(&format!("-{}\n", old));
            }
            if let Some(new) = new {
                raw.push_str(&format!("+{}\n", new));
            }
        }

        Ok(filter_patch(raw.as_bytes(), &options.matcher))
    }

    async fn archive(&self, options: &ArchiveOptions) -> StrataResult<Archive> {
        let state = self.state.lock().unwrap();
        let tree = Self::tree(&state, &options.commit)?;
        let files = Self::matched(&tree, &options.matcher);

        let mut content = Vec::new();
        for (path, data) in &files {
            content.extend_from_slice(format!("{}\0{}\0", path, data).as_bytes());
        }
        Ok(Archive {
            commit: options.commit.clone(),
            content,
            paths: files.into_iter().map(|(path, _)| path).collect(),
        })
    }
}
