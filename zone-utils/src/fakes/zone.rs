// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory zone backend.

use crate::zone::{
    ErrorCode, Property, Resource, State, Zone, ZoneError, ZoneManager,
};
use crate::zonecfg::{ConfigEdit, ZoneConfiguration};

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

struct FakeZone {
    state: State,
    id: Option<i32>,
    committed: ZoneConfiguration,
    editing: Option<ZoneConfiguration>,
}

impl FakeZone {
    fn brand(&self) -> String {
        self.committed
            .properties(&Resource::kind("global"), &["brand"])
            .ok()
            .and_then(|props| props.into_iter().next())
            .map(|p| p.value())
            .unwrap_or_default()
    }

    fn config(&self) -> &ZoneConfiguration {
        self.editing.as_ref().unwrap_or(&self.committed)
    }
}

#[derive(Default)]
struct Inner {
    zones: BTreeMap<String, FakeZone>,
    templates: BTreeMap<String, ZoneConfiguration>,
    calls: Vec<String>,
    mutations: Vec<String>,
    failures: HashMap<String, VecDeque<ZoneError>>,
    next_id: i32,
}

/// A zone backend holding zones in memory.
///
/// Every call is recorded as "`op` `zone` `options...`". Failures may be
/// queued per operation with [FakeZoneManager::fail_next].
pub struct FakeZoneManager {
    inner: Mutex<Inner>,
    closed: AtomicBool,
}

fn brand_template(
    brand: &str,
    anet: Property,
    extra: Vec<Resource>,
) -> ZoneConfiguration {
    let mut resources = vec![
        Resource::new("global", vec![Property::new("brand", brand)]),
        Resource::new(
            "anet",
            vec![
                anet,
                Property::new("lower-link", "auto"),
                Property::new("mac-address", "auto"),
            ],
        ),
    ];
    resources.extend(extra);
    ZoneConfiguration::new(resources)
}

fn invalid_state(name: &str, state: State, op: &str) -> ZoneError {
    ZoneError::new(
        ErrorCode::InvalidZoneState,
        format!("zone '{name}' is {state}; cannot {op}"),
    )
}

impl FakeZoneManager {
    pub fn new() -> Arc<Self> {
        let mut templates = BTreeMap::new();
        templates.insert(
            "SYSdefault".to_string(),
            brand_template(
                "solaris",
                Property::new("linkname", "net0"),
                vec![],
            ),
        );
        templates.insert(
            "SYSsolaris-kz".to_string(),
            brand_template(
                "solaris-kz",
                Property::new("id", "0"),
                vec![
                    Resource::new(
                        "device",
                        vec![
                            Property::new("bootpri", "0"),
                            Property::new("id", "0"),
                        ],
                    ),
                    Resource::new(
                        "capped-memory",
                        vec![Property::new("physical", "4G")],
                    ),
                ],
            ),
        );
        Arc::new(Self {
            inner: Mutex::new(Inner {
                templates,
                next_id: 1,
                ..Default::default()
            }),
            closed: AtomicBool::new(false),
        })
    }

    /// Marks the connection closed.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Makes the next call of `op` fail with `err`.
    pub fn fail_next(&self, op: &str, err: ZoneError) {
        self.inner
            .lock()
            .unwrap()
            .failures
            .entry(op.to_string())
            .or_default()
            .push_back(err);
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Calls which changed configuration or zone state.
    pub fn mutations(&self) -> Vec<String> {
        self.inner.lock().unwrap().mutations.clone()
    }

    pub fn committed_config(&self, name: &str) -> Option<ZoneConfiguration> {
        self.inner.lock().unwrap().zones.get(name).map(|z| z.committed.clone())
    }

    pub fn is_editing(&self, name: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .zones
            .get(name)
            .is_some_and(|z| z.editing.is_some())
    }

    pub fn state(&self, name: &str) -> Option<State> {
        self.inner.lock().unwrap().zones.get(name).map(|z| z.state)
    }

    /// Forces a zone into `state`, as if changed behind our back.
    pub fn set_state(&self, name: &str, state: State) {
        if let Some(zone) = self.inner.lock().unwrap().zones.get_mut(name) {
            zone.state = state;
        }
    }

    /// Adds a zone with the given committed configuration and state.
    pub fn insert_zone(
        &self,
        name: &str,
        state: State,
        config: ZoneConfiguration,
    ) {
        self.inner.lock().unwrap().zones.insert(
            name.to_string(),
            FakeZone { state, id: None, committed: config, editing: None },
        );
    }

    fn begin(
        &self,
        op: &str,
        name: &str,
        options: &[String],
    ) -> Result<(), ZoneError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(call_string(op, name, options));
        if let Some(err) =
            inner.failures.get_mut(op).and_then(|queue| queue.pop_front())
        {
            return Err(err);
        }
        Ok(())
    }

    fn mutate<T>(
        &self,
        op: &str,
        name: &str,
        options: &[String],
        f: impl FnOnce(&mut FakeZone) -> Result<T, ZoneError>,
    ) -> Result<T, ZoneError> {
        self.begin(op, name, options)?;
        let mut inner = self.inner.lock().unwrap();
        let zone = inner.zones.get_mut(name).ok_or_else(|| missing(name))?;
        let result = f(zone)?;
        inner.mutations.push(call_string(op, name, options));
        Ok(result)
    }

    fn edit(
        &self,
        op: &str,
        name: &str,
        edit: ConfigEdit,
    ) -> Result<(), ZoneError> {
        self.mutate(op, name, &[], |zone| {
            let config = zone.editing.as_mut().ok_or_else(|| {
                ZoneError::new(ErrorCode::NotEditing, "no edit in progress")
            })?;
            config.apply(&edit)
        })
    }

    fn read<T>(
        &self,
        op: &str,
        name: &str,
        f: impl FnOnce(&ZoneConfiguration) -> Result<T, ZoneError>,
    ) -> Result<T, ZoneError> {
        self.begin(op, name, &[])?;
        let inner = self.inner.lock().unwrap();
        let zone = inner.zones.get(name).ok_or_else(|| missing(name))?;
        f(zone.config())
    }

    fn transition(
        &self,
        op: &str,
        name: &str,
        options: &[String],
        from: &[State],
        to: State,
    ) -> Result<(), ZoneError> {
        let next_id = {
            let mut inner = self.inner.lock().unwrap();
            inner.next_id += 1;
            inner.next_id
        };
        self.mutate(op, name, options, |zone| {
            if !from.contains(&zone.state) {
                return Err(invalid_state(name, zone.state, op));
            }
            zone.state = to;
            zone.id = match to {
                State::Running | State::Ready => Some(next_id),
                _ => None,
            };
            Ok(())
        })
    }
}

fn call_string(op: &str, name: &str, options: &[String]) -> String {
    std::iter::once(op)
        .chain(std::iter::once(name))
        .chain(options.iter().map(|o| o.as_str()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn missing(name: &str) -> ZoneError {
    ZoneError::new(
        ErrorCode::InvalidArgument,
        format!("zone '{name}' does not exist"),
    )
}

const RUNNING: &[State] = &[State::Running, State::Ready];

#[async_trait]
impl ZoneManager for FakeZoneManager {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn list(&self, pattern: &str) -> Result<Vec<Zone>, ZoneError> {
        self.begin("list", pattern, &[])?;
        let pattern = glob::Pattern::new(pattern).map_err(|e| {
            ZoneError::new(ErrorCode::InvalidArgument, e.to_string())
        })?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .zones
            .iter()
            .filter(|(name, _)| pattern.matches(name))
            .map(|(name, zone)| Zone {
                name: name.clone(),
                id: zone.id,
                brand: zone.brand(),
                state: zone.state,
            })
            .collect())
    }

    async fn create(
        &self,
        name: &str,
        template: &str,
    ) -> Result<(), ZoneError> {
        self.begin("create", name, &[template.to_string()])?;
        let mut inner = self.inner.lock().unwrap();
        if inner.zones.contains_key(name) {
            return Err(ZoneError::new(
                ErrorCode::InvalidArgument,
                format!("zone '{name}' already exists"),
            ));
        }
        let committed =
            inner.templates.get(template).cloned().ok_or_else(|| {
                ZoneError::new(
                    ErrorCode::InvalidArgument,
                    format!("no such template '{template}'"),
                )
            })?;
        inner.zones.insert(
            name.to_string(),
            FakeZone {
                state: State::Configured,
                id: None,
                committed,
                editing: None,
            },
        );
        inner.mutations.push(format!("create {name} {template}"));
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), ZoneError> {
        self.mutate("delete", name, &[], |zone| {
            if zone.state != State::Configured {
                return Err(invalid_state(name, zone.state, "delete"));
            }
            Ok(())
        })?;
        self.inner.lock().unwrap().zones.remove(name);
        Ok(())
    }

    async fn edit_config(&self, name: &str) -> Result<(), ZoneError> {
        self.begin("edit_config", name, &[])?;
        let mut inner = self.inner.lock().unwrap();
        let zone = inner.zones.get_mut(name).ok_or_else(|| missing(name))?;
        if zone.editing.is_some() {
            return Err(ZoneError::new(
                ErrorCode::AlreadyEditing,
                "an edit is already in progress",
            ));
        }
        zone.editing = Some(zone.committed.clone());
        Ok(())
    }

    async fn commit_config(&self, name: &str) -> Result<(), ZoneError> {
        self.begin("commit_config", name, &[])?;
        let mut inner = self.inner.lock().unwrap();
        let zone = inner.zones.get_mut(name).ok_or_else(|| missing(name))?;
        let config = zone.editing.take().ok_or_else(|| {
            ZoneError::new(ErrorCode::NotEditing, "no edit in progress")
        })?;
        zone.committed = config;
        Ok(())
    }

    async fn cancel_config(&self, name: &str) -> Result<(), ZoneError> {
        self.begin("cancel_config", name, &[])?;
        let mut inner = self.inner.lock().unwrap();
        let zone = inner.zones.get_mut(name).ok_or_else(|| missing(name))?;
        zone.editing = None;
        Ok(())
    }

    async fn get_resources(
        &self,
        name: &str,
        filter: &Resource,
    ) -> Result<Vec<Resource>, ZoneError> {
        self.read("get_resources", name, |config| Ok(config.select(filter)))
    }

    async fn get_resource_properties(
        &self,
        name: &str,
        filter: &Resource,
        properties: &[&str],
    ) -> Result<Vec<Property>, ZoneError> {
        self.read("get_resource_properties", name, |config| {
            config.properties(filter, properties)
        })
    }

    async fn add_resource(
        &self,
        name: &str,
        resource: &Resource,
    ) -> Result<(), ZoneError> {
        self.edit("add_resource", name, ConfigEdit::Add(resource.clone()))
    }

    async fn set_resource_properties(
        &self,
        name: &str,
        filter: &Resource,
        properties: &[Property],
    ) -> Result<(), ZoneError> {
        self.edit(
            "set_resource_properties",
            name,
            ConfigEdit::Set {
                filter: filter.clone(),
                properties: properties.to_vec(),
            },
        )
    }

    async fn remove_resources(
        &self,
        name: &str,
        filter: &Resource,
    ) -> Result<(), ZoneError> {
        self.edit("remove_resources", name, ConfigEdit::Remove(filter.clone()))
    }

    async fn clear_resource_properties(
        &self,
        name: &str,
        filter: &Resource,
        properties: &[&str],
    ) -> Result<(), ZoneError> {
        self.edit(
            "clear_resource_properties",
            name,
            ConfigEdit::Clear {
                filter: filter.clone(),
                properties: properties.iter().map(|p| p.to_string()).collect(),
            },
        )
    }

    async fn export_config(&self, name: &str) -> Result<String, ZoneError> {
        self.read("export_config", name, |config| Ok(config.export()))
    }

    async fn install(
        &self,
        name: &str,
        options: &[String],
    ) -> Result<(), ZoneError> {
        self.transition(
            "install",
            name,
            options,
            &[State::Configured],
            State::Installed,
        )
    }

    async fn uninstall(
        &self,
        name: &str,
        options: &[String],
    ) -> Result<(), ZoneError> {
        self.transition(
            "uninstall",
            name,
            options,
            &[State::Installed],
            State::Configured,
        )
    }

    async fn attach(
        &self,
        name: &str,
        options: &[String],
    ) -> Result<(), ZoneError> {
        self.transition(
            "attach",
            name,
            options,
            &[State::Configured],
            State::Installed,
        )
    }

    async fn detach(
        &self,
        name: &str,
        options: &[String],
    ) -> Result<(), ZoneError> {
        self.transition(
            "detach",
            name,
            options,
            &[State::Installed],
            State::Configured,
        )
    }

    async fn boot(
        &self,
        name: &str,
        options: &[String],
    ) -> Result<(), ZoneError> {
        self.transition(
            "boot",
            name,
            options,
            &[State::Installed, State::Ready],
            State::Running,
        )
    }

    async fn shutdown(
        &self,
        name: &str,
        options: &[String],
    ) -> Result<(), ZoneError> {
        let to = if options.iter().any(|o| o == "-r") {
            State::Running
        } else {
            State::Installed
        };
        self.transition("shutdown", name, options, RUNNING, to)
    }

    async fn halt(&self, name: &str) -> Result<(), ZoneError> {
        self.transition("halt", name, &[], RUNNING, State::Installed)
    }

    async fn reboot(
        &self,
        name: &str,
        options: &[String],
    ) -> Result<(), ZoneError> {
        self.transition("reboot", name, options, RUNNING, State::Running)
    }

    async fn suspend(&self, name: &str) -> Result<(), ZoneError> {
        self.transition("suspend", name, &[], RUNNING, State::Installed)
    }

    async fn migrate(
        &self,
        name: &str,
        options: &[String],
    ) -> Result<(), ZoneError> {
        if options.iter().any(|o| o == "-nq" || o == "-n") {
            self.begin("migrate", name, options)?;
            return Ok(());
        }
        self.transition("migrate", name, options, RUNNING, State::Configured)
    }

    async fn apply(&self, name: &str) -> Result<(), ZoneError> {
        self.mutate("apply", name, &[], |_| Ok(()))
    }
}
