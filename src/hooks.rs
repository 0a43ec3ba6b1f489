use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use stacked_errors::{bail, Result, StackableErr};
use tokio::time::timeout;
use tracing::debug;

use crate::Command;

// pre hooks gate the operation, so they are not allowed to stall it for long
const PRE_HOOK_TIMEOUT: Duration = Duration::from_secs(2);

/// When a hook fires relative to the event it is registered for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookMode {
    /// Runs before the event, synchronously; a failure or timeout fails the
    /// operation
    Pre,
    /// Runs after the event on its own task; failures are discarded
    Post,
}

#[derive(Debug, Clone)]
struct Hook {
    /// Path of the hook executable relative to the registry root
    name: String,
    root: PathBuf,
    /// Base filename, the sort key within a category
    file_name: String,
    /// Empty means the hook applies to every action of its category
    action: String,
}

/// An owned registry of filesystem hooks, loaded once at startup and handed
/// to the engine. Hooks live at `<root>/<category>/<file>` (every action) or
/// `<root>/<category>/<action>/<file>` (one action), and run in descending
/// base-filename order within their category.
#[derive(Debug, Clone, Default)]
pub struct HookRegistry {
    registered: BTreeMap<String, Vec<Hook>>,
}

impl HookRegistry {
    /// Walks `root` and registers every file found. A missing `root` is an
    /// empty registry.
    pub fn load_all(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let mut registry = Self::default();
        if !root.is_dir() {
            return Ok(registry);
        }
        registry.load_dir(&root, "")?;
        for hooks in registry.registered.values_mut() {
            hooks.sort_by(|a, b| b.file_name.cmp(&a.file_name));
        }
        Ok(registry)
    }

    fn load_dir(&mut self, root: &PathBuf, rel: &str) -> Result<()> {
        let dir = if rel.is_empty() {
            root.clone()
        } else {
            root.join(rel)
        };
        for entry in std::fs::read_dir(&dir).stack_err_with(|| format!("can't read {dir:?}"))? {
            let entry = entry.stack()?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let rel_name = if rel.is_empty() {
                name
            } else {
                format!("{rel}/{name}")
            };
            if entry.file_type().stack()?.is_dir() {
                self.load_dir(root, &rel_name)?;
            } else {
                self.register(root.clone(), rel_name);
            }
        }
        Ok(())
    }

    fn register(&mut self, root: PathBuf, name: String) {
        let parts: Vec<&str> = name.split('/').collect();
        let category = parts[0].to_owned();
        // `<category>/<action>/<file>` scopes the hook to one action
        let action = if parts.len() > 2 {
            parts[1].to_owned()
        } else {
            String::new()
        };
        let file_name = parts.last().unwrap_or(&"").to_string();
        self.registered.entry(category).or_default().push(Hook {
            name,
            root,
            file_name,
            action,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }

    /// Fires the hooks registered for `(category, action)`. Pre hooks run in
    /// order with a 2 s limit each and their failure is the caller's
    /// failure; post hooks are spawned and forgotten.
    pub async fn execute(
        &self,
        category: &str,
        action: &str,
        mode: HookMode,
        env: &[(String, String)],
    ) -> Result<()> {
        let Some(hooks) = self.registered.get(category) else {
            return Ok(());
        };
        let mut env = env.to_vec();
        env.push((
            "DOCKER_ACTION".to_owned(),
            format!("{category}_{action}"),
        ));
        for hook in hooks {
            if !(hook.action.is_empty() || (hook.action == action)) {
                continue;
            }
            let command = Command::new_os_str(hook.root.join(&hook.name))
                .env_clear(true)
                .envs(env.iter().map(|(k, v)| (k, v)));
            match mode {
                HookMode::Pre => {
                    let name = hook.name.clone();
                    let comres = timeout(PRE_HOOK_TIMEOUT, command.run_to_completion())
                        .await
                        .ok()
                        .stack_err_with(|| format!("hook timeout: {name}"))?
                        .stack_err_with(|| format!("hook failure: {name}"))?;
                    if !comres.successful() {
                        bail!("hook failure: {name}")
                    }
                }
                HookMode::Post => {
                    let name = hook.name.clone();
                    tokio::task::spawn(async move {
                        match command.run_to_completion().await {
                            Ok(comres) if comres.successful() => (),
                            other => debug!("post hook {name} discarded: {other:?}"),
                        }
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install_hook(root: &std::path::Path, rel: &str, script: &str) {
        use std::os::unix::fs::PermissionsExt;
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[tokio::test]
    async fn missing_root_is_empty() {
        let registry = HookRegistry::load_all("/no/such/hooks/root").unwrap();
        assert!(registry.is_empty());
        registry
            .execute("engine", "start", HookMode::Pre, &[])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn pre_hooks_gate_and_filter_by_action() {
        let tmp = tempfile::tempdir().unwrap();
        install_hook(tmp.path(), "engine/all-actions", "true");
        install_hook(
            tmp.path(),
            "engine/build/check-env",
            "test \"$DOCKER_ACTION\" = engine_build",
        );
        install_hook(tmp.path(), "engine/clean/only-clean", "exit 1");
        let registry = HookRegistry::load_all(tmp.path()).unwrap();
        // the always-on hook sees the composed DOCKER_ACTION
        registry
            .execute("engine", "build", HookMode::Pre, &[])
            .await
            .unwrap();
        // the scoped hook only fires for its action
        assert!(registry
            .execute("engine", "clean", HookMode::Pre, &[])
            .await
            .is_err());
        // unknown categories are a no-op
        registry
            .execute("elsewhere", "build", HookMode::Pre, &[])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn hooks_run_in_descending_file_name_order() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("fired.log");
        install_hook(
            tmp.path(),
            "engine/alpha",
            &format!("echo alpha >> {}", log.display()),
        );
        install_hook(
            tmp.path(),
            "engine/omega",
            &format!("echo omega >> {}", log.display()),
        );
        let registry = HookRegistry::load_all(tmp.path()).unwrap();
        registry
            .execute("engine", "anything", HookMode::Pre, &[])
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "omega\nalpha\n");
    }

    #[tokio::test]
    async fn post_hook_failures_are_discarded() {
        let tmp = tempfile::tempdir().unwrap();
        install_hook(tmp.path(), "engine/fails", "exit 7");
        let registry = HookRegistry::load_all(tmp.path()).unwrap();
        registry
            .execute("engine", "anything", HookMode::Post, &[])
            .await
            .unwrap();
    }
}
