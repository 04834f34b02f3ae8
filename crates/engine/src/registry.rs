//! Trigger registry: automations indexed by trigger shape.
//!
//! A [`TriggerRegistry`] is immutable once built. Reloading builds a fresh
//! one and swaps it into the [`RegistryHandle`] in one atomic step, so a
//! lookup sees either the old set or the new set, never a mixture. Runs
//! already in flight keep the `Arc<Automation>` they started with.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tracing::info;

use crate::error::RegistryError;
use crate::models::{ActionKind, ActionNode, Automation, Trigger};
use crate::schedule::CronSchedule;
use crate::verify::VerifierSet;

/// A cron trigger ready for evaluation.
#[derive(Debug, Clone)]
pub struct CronEntry {
    pub automation_id: String,
    pub schedule: CronSchedule,
}

#[derive(Default)]
pub struct TriggerRegistry {
    automations: HashMap<String, Arc<Automation>>,
    /// `(METHOD, /path)` → automation id.
    routes: HashMap<(String, String), String>,
    tables: HashMap<String, Vec<String>>,
    cron: Vec<CronEntry>,
}

impl TriggerRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Index `automations`, rejecting the whole set on the first conflict.
    pub fn build(
        automations: Vec<Automation>,
        verifiers: &VerifierSet,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::default();

        for automation in automations {
            if registry.automations.contains_key(&automation.id) {
                return Err(RegistryError::DuplicateId(automation.id));
            }
            validate_actions(&automation.id, &automation.actions)?;

            match &automation.trigger {
                Trigger::HttpGet { path, .. } => registry.add_route("GET", path, &automation.id)?,
                Trigger::HttpPost { path, .. } => {
                    registry.add_route("POST", path, &automation.id)?
                }
                Trigger::Webhook { provider, path, .. } => {
                    if !verifiers.contains(provider) {
                        return Err(RegistryError::UnknownProvider {
                            automation_id: automation.id.clone(),
                            provider: provider.clone(),
                        });
                    }
                    // GET answers the provider's handshake, POST delivers.
                    registry.add_route("GET", path, &automation.id)?;
                    registry.add_route("POST", path, &automation.id)?;
                }
                Trigger::Cron {
                    expression,
                    timezone,
                } => {
                    let schedule = CronSchedule::parse(expression, timezone).map_err(|message| {
                        RegistryError::InvalidCron {
                            automation_id: automation.id.clone(),
                            message,
                        }
                    })?;
                    registry.cron.push(CronEntry {
                        automation_id: automation.id.clone(),
                        schedule,
                    });
                }
                Trigger::DatabaseRecordCreated { table } => registry
                    .tables
                    .entry(table.clone())
                    .or_default()
                    .push(automation.id.clone()),
            }

            registry
                .automations
                .insert(automation.id.clone(), Arc::new(automation));
        }

        Ok(registry)
    }

    fn add_route(&mut self, method: &str, path: &str, automation_id: &str) -> Result<(), RegistryError> {
        if !path.starts_with('/') {
            return Err(RegistryError::InvalidDefinition {
                automation_id: automation_id.to_string(),
                message: format!("trigger path '{path}' must start with '/'"),
            });
        }

        let key = (method.to_string(), normalize_path(path));
        if let Some(first) = self.routes.get(&key) {
            return Err(RegistryError::DuplicateRoute {
                method: key.0,
                path: key.1,
                first: first.clone(),
                second: automation_id.to_string(),
            });
        }
        self.routes.insert(key, automation_id.to_string());
        Ok(())
    }

    pub fn get(&self, automation_id: &str) -> Option<Arc<Automation>> {
        self.automations.get(automation_id).cloned()
    }

    pub fn by_route(&self, method: &str, path: &str) -> Option<Arc<Automation>> {
        let key = (method.to_ascii_uppercase(), normalize_path(path));
        self.routes.get(&key).and_then(|id| self.get(id))
    }

    pub fn by_table(&self, table: &str) -> Vec<Arc<Automation>> {
        self.tables
            .get(table)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn tables(&self) -> HashSet<String> {
        self.tables.keys().cloned().collect()
    }

    pub fn cron_entries(&self) -> &[CronEntry] {
        &self.cron
    }

    /// All automations, sorted by id.
    pub fn automations(&self) -> Vec<Arc<Automation>> {
        let mut all: Vec<_> = self.automations.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.automations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.automations.is_empty()
    }
}

/// Trailing slashes are not significant: `/hooks/lead/` is `/hooks/lead`.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn validate_actions(automation_id: &str, actions: &[ActionNode]) -> Result<(), RegistryError> {
    let invalid = |message: String| RegistryError::InvalidDefinition {
        automation_id: automation_id.to_string(),
        message,
    };

    for action in actions {
        if let Some(name) = &action.name {
            if name.is_empty() || name.contains('.') {
                return Err(invalid(format!("invalid action name '{name}'")));
            }
        }
        if let ActionKind::SplitIntoPaths { paths } = &action.kind {
            let mut seen = HashSet::new();
            for path in paths {
                if path.name.is_empty() || path.name.contains('.') {
                    return Err(invalid(format!("invalid path name '{}'", path.name)));
                }
                if !seen.insert(path.name.as_str()) {
                    return Err(invalid(format!("duplicate path name '{}'", path.name)));
                }
                validate_actions(automation_id, &path.actions)?;
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Hot-reload handle
// ---------------------------------------------------------------------------

/// Shared, atomically swappable registry.
#[derive(Clone)]
pub struct RegistryHandle {
    current: Arc<ArcSwap<TriggerRegistry>>,
    version: Arc<watch::Sender<u64>>,
}

impl RegistryHandle {
    pub fn new(registry: TriggerRegistry) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            current: Arc::new(ArcSwap::from_pointee(registry)),
            version: Arc::new(version),
        }
    }

    /// Snapshot of the current registry.
    pub fn load(&self) -> Arc<TriggerRegistry> {
        self.current.load_full()
    }

    /// Replace the registry and notify subscribers.
    pub fn swap(&self, registry: TriggerRegistry) {
        let count = registry.len();
        self.current.store(Arc::new(registry));
        self.version.send_modify(|v| *v += 1);
        info!(automations = count, "trigger registry swapped");
    }

    /// Fires whenever [`RegistryHandle::swap`] runs.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Condition;
    use crate::models::{BranchPath, ProviderParams};

    fn post(id: &str, path: &str) -> Automation {
        Automation::new(
            id,
            Trigger::HttpPost {
                path: path.into(),
                respond_immediately: false,
                body_shape: None,
                secret: None,
                signature_header: None,
                delivery_id_header: None,
            },
            vec![],
        )
    }

    fn record(id: &str, table: &str) -> Automation {
        Automation::new(id, Trigger::DatabaseRecordCreated { table: table.into() }, vec![])
    }

    #[test]
    fn indexes_by_route_table_and_cron() {
        let cron = Automation::new(
            "nightly",
            Trigger::Cron {
                expression: "0 2 * * *".into(),
                timezone: "UTC".into(),
            },
            vec![],
        );
        let registry = TriggerRegistry::build(
            vec![post("lead", "/hooks/lead"), record("a", "orders"), record("b", "orders"), cron],
            &VerifierSet::default(),
        )
        .unwrap();

        assert_eq!(registry.by_route("post", "/hooks/lead/").unwrap().id, "lead");
        assert!(registry.by_route("GET", "/hooks/lead").is_none());
        assert_eq!(registry.by_table("orders").len(), 2);
        assert_eq!(registry.cron_entries()[0].automation_id, "nightly");
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn duplicate_route_is_rejected() {
        let err = TriggerRegistry::build(
            vec![post("a", "/x"), post("b", "/x/")],
            &VerifierSet::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, RegistryError::DuplicateRoute { .. }));
    }

    #[test]
    fn webhook_claims_get_and_post() {
        let webhook = Automation::new(
            "fb",
            Trigger::Webhook {
                provider: "meta".into(),
                path: "/hooks/fb".into(),
                params: ProviderParams::default(),
                respond_immediately: true,
            },
            vec![],
        );
        let registry = TriggerRegistry::build(vec![webhook], &VerifierSet::default()).unwrap();
        assert!(registry.by_route("GET", "/hooks/fb").is_some());
        assert!(registry.by_route("POST", "/hooks/fb").is_some());
    }

    #[test]
    fn unknown_provider_and_bad_cron_are_rejected() {
        let webhook = Automation::new(
            "x",
            Trigger::Webhook {
                provider: "myspace".into(),
                path: "/x".into(),
                params: ProviderParams::default(),
                respond_immediately: false,
            },
            vec![],
        );
        assert!(matches!(
            TriggerRegistry::build(vec![webhook], &VerifierSet::default()),
            Err(RegistryError::UnknownProvider { .. })
        ));

        let cron = Automation::new(
            "c",
            Trigger::Cron {
                expression: "61 * * * *".into(),
                timezone: "UTC".into(),
            },
            vec![],
        );
        assert!(matches!(
            TriggerRegistry::build(vec![cron], &VerifierSet::default()),
            Err(RegistryError::InvalidCron { .. })
        ));
    }

    #[test]
    fn duplicate_split_path_names_are_rejected() {
        let path = |name: &str| BranchPath {
            name: name.into(),
            condition: Condition::always(),
            actions: vec![],
        };
        let mut automation = post("split", "/s");
        automation.actions = vec![ActionNode::new(ActionKind::SplitIntoPaths {
            paths: vec![path("A"), path("A")],
        })];
        assert!(matches!(
            TriggerRegistry::build(vec![automation], &VerifierSet::default()),
            Err(RegistryError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn swap_is_visible_to_new_loads_and_notifies() {
        let handle = RegistryHandle::new(TriggerRegistry::empty());
        let mut changes = handle.subscribe();
        let before = handle.load();

        let next = TriggerRegistry::build(vec![post("a", "/a")], &VerifierSet::default()).unwrap();
        handle.swap(next);

        assert!(before.is_empty());
        assert_eq!(handle.load().len(), 1);
        assert!(changes.has_changed().unwrap());
    }
}
