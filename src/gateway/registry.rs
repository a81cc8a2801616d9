//! Namespace registries: aggregated capability definitions across backends.
//!
//! Provides:
//! - Collision-free public keys (see `naming`)
//! - O(1) lookup by public key, tool aliases resolved first
//! - A per-server index for bulk removal
//! - A cached full listing, rebuilt lazily after any mutation

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use super::naming::{prefix_name, prefix_resource_uri};
use crate::backend::types::{Prompt, Resource, Tool};

// ─── Entries ─────────────────────────────────────────────────────────────────

/// A capability definition the registry can key and index.
pub trait RegistryEntry: Clone + Send + Sync + 'static {
    /// Definition as advertised by the backend.
    type Item: Clone;

    /// Backend-local name, matched against allow-lists.
    fn local_name(item: &Self::Item) -> &str;

    /// Public key for `item` served by `server`.
    fn public_key(server: &str, item: &Self::Item) -> String;

    fn from_parts(server: &str, key: String, item: Self::Item) -> Self;

    fn key(&self) -> &str;

    fn server(&self) -> &str;
}

/// A registered tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolEntry {
    pub server: String,
    pub key: String,
    /// Original definition with the backend-local name.
    pub tool: Tool,
}

impl ToolEntry {
    /// The definition as advertised by the gateway, named by its public key.
    pub fn public_definition(&self) -> Tool {
        Tool {
            name: self.key.clone(),
            ..self.tool.clone()
        }
    }
}

impl RegistryEntry for ToolEntry {
    type Item = Tool;

    fn local_name(item: &Tool) -> &str {
        &item.name
    }

    fn public_key(server: &str, item: &Tool) -> String {
        prefix_name(server, &item.name)
    }

    fn from_parts(server: &str, key: String, tool: Tool) -> Self {
        Self {
            server: server.to_string(),
            key,
            tool,
        }
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn server(&self) -> &str {
        &self.server
    }
}

/// A registered resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceEntry {
    pub server: String,
    pub key: String,
    pub resource: Resource,
}

impl ResourceEntry {
    pub fn public_definition(&self) -> Resource {
        Resource {
            uri: self.key.clone(),
            ..self.resource.clone()
        }
    }
}

impl RegistryEntry for ResourceEntry {
    type Item = Resource;

    fn local_name(item: &Resource) -> &str {
        &item.uri
    }

    fn public_key(server: &str, item: &Resource) -> String {
        prefix_resource_uri(server, &item.uri)
    }

    fn from_parts(server: &str, key: String, resource: Resource) -> Self {
        Self {
            server: server.to_string(),
            key,
            resource,
        }
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn server(&self) -> &str {
        &self.server
    }
}

/// A registered prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptEntry {
    pub server: String,
    pub key: String,
    pub prompt: Prompt,
}

impl PromptEntry {
    pub fn public_definition(&self) -> Prompt {
        Prompt {
            name: self.key.clone(),
            ..self.prompt.clone()
        }
    }
}

impl RegistryEntry for PromptEntry {
    type Item = Prompt;

    fn local_name(item: &Prompt) -> &str {
        &item.name
    }

    fn public_key(server: &str, item: &Prompt) -> String {
        prefix_name(server, &item.name)
    }

    fn from_parts(server: &str, key: String, prompt: Prompt) -> Self {
        Self {
            server: server.to_string(),
            key,
            prompt,
        }
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn server(&self) -> &str {
        &self.server
    }
}

// ─── NamespaceRegistry ───────────────────────────────────────────────────────

/// What `register` did with an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    Inserted,
    /// The key existed; `previous_server` owned the overwritten entry.
    Replaced { previous_server: String },
    /// Dropped by the allow-list.
    Filtered,
}

struct Inner<E> {
    entries: HashMap<String, E>,
    /// `server → keys`; every key here is in `entries` and vice versa.
    by_server: HashMap<String, Vec<String>>,
    cache: Vec<E>,
    cache_valid: bool,
    /// `alias → public key`. Only tool registries expose alias methods.
    aliases: HashMap<String, String>,
}

impl<E> Inner<E> {
    fn unindex(&mut self, server: &str, key: &str) {
        if let Some(keys) = self.by_server.get_mut(server) {
            keys.retain(|k| k != key);
            if keys.is_empty() {
                self.by_server.remove(server);
            }
        }
    }
}

/// Aggregated capability registry, one per capability kind.
pub struct NamespaceRegistry<E> {
    inner: RwLock<Inner<E>>,
}

pub type ToolRegistry = NamespaceRegistry<ToolEntry>;
pub type ResourceRegistry = NamespaceRegistry<ResourceEntry>;
pub type PromptRegistry = NamespaceRegistry<PromptEntry>;

impl<E: RegistryEntry> NamespaceRegistry<E> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                by_server: HashMap::new(),
                cache: Vec::new(),
                cache_valid: false,
                aliases: HashMap::new(),
            }),
        }
    }

    /// Register one item from `server`.
    ///
    /// A non-empty `allow_list` that does not name the item drops it. An
    /// existing entry under the same key is overwritten, whichever server
    /// owned it.
    pub fn register(&self, server: &str, item: E::Item, allow_list: &[String]) -> RegisterOutcome {
        if !allow_list.is_empty() && !allow_list.iter().any(|a| a == E::local_name(&item)) {
            return RegisterOutcome::Filtered;
        }

        let key = E::public_key(server, &item);
        let entry = E::from_parts(server, key.clone(), item);

        let mut inner = self.inner.write();
        let outcome = match inner.entries.insert(key.clone(), entry) {
            None => {
                inner
                    .by_server
                    .entry(server.to_string())
                    .or_default()
                    .push(key);
                RegisterOutcome::Inserted
            }
            Some(previous) if previous.server() == server => RegisterOutcome::Replaced {
                previous_server: server.to_string(),
            },
            Some(previous) => {
                inner.unindex(previous.server(), &key);
                inner
                    .by_server
                    .entry(server.to_string())
                    .or_default()
                    .push(key);
                RegisterOutcome::Replaced {
                    previous_server: previous.server().to_string(),
                }
            }
        };
        inner.cache_valid = false;
        outcome
    }

    /// Register a batch; returns how many were not filtered.
    pub fn register_all(
        &self,
        server: &str,
        items: impl IntoIterator<Item = E::Item>,
        allow_list: &[String],
    ) -> usize {
        items
            .into_iter()
            .filter(|item| self.register(server, item.clone(), allow_list) != RegisterOutcome::Filtered)
            .count()
    }

    /// Look up by public key (or tool alias).
    pub fn get(&self, key: &str) -> Option<E> {
        let inner = self.inner.read();
        let key = inner.aliases.get(key).map(String::as_str).unwrap_or(key);
        inner.entries.get(key).cloned()
    }

    /// Every entry, in unspecified order.
    pub fn all(&self) -> Vec<E> {
        {
            let inner = self.inner.read();
            if inner.cache_valid {
                return inner.cache.clone();
            }
        }

        let mut guard = self.inner.write();
        let inner = &mut *guard;
        // Another writer may have rebuilt it between the two locks.
        if !inner.cache_valid {
            inner.cache = inner.entries.values().cloned().collect();
            inner.cache_valid = true;
        }
        inner.cache.clone()
    }

    /// Entries of one server, sorted by key.
    pub fn for_server(&self, server: &str) -> Vec<E> {
        let inner = self.inner.read();
        let mut entries: Vec<E> = inner
            .by_server
            .get(server)
            .map(|keys| keys.iter().filter_map(|k| inner.entries.get(k).cloned()).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.key().cmp(b.key()));
        entries
    }

    /// Servers with at least one entry, sorted.
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().by_server.keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop every entry of `server`; returns how many were removed.
    pub fn remove_server(&self, server: &str) -> usize {
        let mut inner = self.inner.write();
        let removed = match inner.by_server.remove(server) {
            Some(keys) => {
                for key in &keys {
                    inner.entries.remove(key);
                }
                keys.len()
            }
            None => 0,
        };
        inner.cache_valid = false;
        removed
    }

    /// Drop everything, aliases included.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.by_server.clear();
        inner.aliases.clear();
        inner.cache.clear();
        inner.cache_valid = false;
    }

    pub fn count(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }
}

impl<E: RegistryEntry> Default for NamespaceRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceRegistry<ToolEntry> {
    /// Map `alias` to a public tool key. Returns the previous target.
    pub fn add_alias(&self, alias: &str, key: &str) -> Option<String> {
        let mut inner = self.inner.write();
        inner.cache_valid = false;
        inner.aliases.insert(alias.to_string(), key.to_string())
    }

    pub fn remove_alias(&self, alias: &str) -> Option<String> {
        let mut inner = self.inner.write();
        inner.cache_valid = false;
        inner.aliases.remove(alias)
    }

    /// The key `name` refers to: its alias target, or `name` itself.
    pub fn resolve_alias(&self, name: &str) -> String {
        self.inner
            .read()
            .aliases
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    pub fn aliases(&self) -> BTreeMap<String, String> {
        self.inner
            .read()
            .aliases
            .iter()
            .map(|(a, k)| (a.clone(), k.clone()))
            .collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn allow(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn tool(name: &str) -> Tool {
        Tool::new(name, &format!("{name} tool"))
    }

    fn build_github_registry() -> ToolRegistry {
        let registry = ToolRegistry::new();
        registry.register("github", tool("search_repos"), &[]);
        registry.register("github", tool("create_issue"), &[]);
        registry
    }

    /// Primary map and per-server index agree.
    fn assert_index_consistent(registry: &ToolRegistry) {
        let inner = registry.inner.read();
        let indexed: usize = inner.by_server.values().map(Vec::len).sum();
        assert_eq!(indexed, inner.entries.len());
        for (server, keys) in &inner.by_server {
            for key in keys {
                assert_eq!(inner.entries[key].server, *server);
            }
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = build_github_registry();
        assert_eq!(registry.count(), 2);

        let entry = registry.get("github_search_repos").unwrap();
        assert_eq!(entry.server, "github");
        assert_eq!(entry.tool.name, "search_repos");
        assert_eq!(entry.public_definition().name, "github_search_repos");
        assert!(registry.get("github_unknown").is_none());
    }

    #[test]
    fn test_allow_list_filters_silently() {
        let registry = ToolRegistry::new();
        let allow_list = allow(&["a"]);

        assert_eq!(registry.register("srv", tool("a"), &allow_list), RegisterOutcome::Inserted);
        assert_eq!(registry.register("srv", tool("b"), &allow_list), RegisterOutcome::Filtered);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_register_all_counts_unfiltered() {
        let registry = ToolRegistry::new();
        let n = registry.register_all(
            "filesystem",
            vec![tool("read_file"), tool("write_file")],
            &allow(&["read_file"]),
        );
        assert_eq!(n, 1);
        assert_eq!(registry.for_server("filesystem").len(), 1);
    }

    #[test]
    fn test_all_reflects_mutations_and_is_stable() {
        let registry = build_github_registry();
        let first = registry.all();
        assert_eq!(first.len(), 2);

        registry.register("filesystem", tool("read_file"), &[]);
        let second = registry.all();
        assert_eq!(second.len(), 3);
        assert!(second.iter().any(|e| e.key == "filesystem_read_file"));

        let mut third = registry.all();
        let mut second_sorted = second.clone();
        second_sorted.sort_by(|a, b| a.key.cmp(&b.key));
        third.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(second_sorted, third);
    }

    #[test]
    fn test_cross_server_collision_moves_index() {
        let registry = ToolRegistry::new();
        registry.register("my-server", tool("x"), &[]);
        let outcome = registry.register("my_server", tool("x"), &[]);

        assert_eq!(
            outcome,
            RegisterOutcome::Replaced {
                previous_server: "my-server".into()
            }
        );
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.get("my_server_x").unwrap().server, "my_server");
        assert_eq!(registry.server_names(), vec!["my_server".to_string()]);
        assert_index_consistent(&registry);

        // Removing the loser must not take the winner's entry with it.
        assert_eq!(registry.remove_server("my-server"), 0);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_same_server_reregistration_does_not_duplicate_index() {
        let registry = build_github_registry();
        registry.register("github", tool("search_repos"), &[]);
        assert_eq!(registry.for_server("github").len(), 2);
        assert_index_consistent(&registry);
    }

    #[test]
    fn test_remove_server_and_clear() {
        let registry = build_github_registry();
        registry.register("filesystem", tool("read_file"), &[]);
        registry.add_alias("search", "github_search_repos");

        assert_eq!(registry.remove_server("github"), 2);
        assert_eq!(registry.all().len(), 1);
        assert!(registry.get("search").is_none());
        assert_index_consistent(&registry);

        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.all().is_empty());
        assert!(registry.aliases().is_empty());
    }

    #[test]
    fn test_alias_resolution() {
        let registry = build_github_registry();
        assert_eq!(registry.add_alias("search", "github_search_repos"), None);

        assert_eq!(registry.get("search").unwrap().key, "github_search_repos");
        assert_eq!(registry.resolve_alias("search"), "github_search_repos");
        assert_eq!(registry.resolve_alias("other"), "other");
        assert_eq!(registry.aliases().len(), 1);

        assert_eq!(registry.remove_alias("search").as_deref(), Some("github_search_repos"));
        assert!(registry.get("search").is_none());
    }

    #[test]
    fn test_resource_keys_keep_uri_verbatim() {
        let registry = ResourceRegistry::new();
        registry.register("my-fs", Resource::new("file:///tmp/a-b.txt", "a-b"), &[]);

        let entry = registry.get("assern://my_fs/file:///tmp/a-b.txt").unwrap();
        assert_eq!(entry.resource.uri, "file:///tmp/a-b.txt");
        assert_eq!(entry.public_definition().uri, entry.key);
    }

    #[test]
    fn test_prompt_keys() {
        let registry = PromptRegistry::new();
        registry.register("github", Prompt::new("review-pr"), &[]);
        assert!(registry.get("github_review_pr").is_some());
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        let registry = ToolRegistry::new();
        std::thread::scope(|s| {
            for t in 0..4 {
                let registry = &registry;
                s.spawn(move || {
                    for i in 0..50 {
                        registry.register(&format!("srv{t}"), tool(&format!("t{i}")), &[]);
                        let _ = registry.all();
                    }
                });
            }
        });
        assert_eq!(registry.count(), 200);
        assert_eq!(registry.all().len(), 200);
        assert_index_consistent(&registry);
    }
}
