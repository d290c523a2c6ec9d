// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Zone types and the protocol used to talk to the zone backend.

use async_trait::async_trait;
use slog::{info, warn, Logger};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

/// The zone brands instances may be created with.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
pub enum Brand {
    /// A non-global zone sharing the host kernel.
    #[strum(serialize = "solaris")]
    Native,
    /// A kernel zone, running its own kernel.
    #[strum(serialize = "solaris-kz")]
    Kernel,
}

/// What a brand is able to do, and how its configuration is spelled.
#[derive(Debug)]
pub struct Capabilities {
    pub template: &'static str,
    pub cpu_resource: &'static str,
    pub memory_cap_property: &'static str,
    pub memory_alignment_mb: Option<u64>,
    pub supports_suspend: bool,
    pub supports_live_migration: bool,
    pub supports_remote_resize: bool,
    pub supports_volume_hotplug: bool,
    /// Property naming an anet; the link is `net{id}` when this is "id".
    pub anet_name_property: &'static str,
    /// Filter selecting the anet created by the brand template.
    pub default_anet: (&'static str, &'static str),
    /// Global properties a flavor may set in addition to the common ones.
    pub global_properties: &'static [&'static str],
}

const NATIVE: Capabilities = Capabilities {
    template: "SYSdefault",
    cpu_resource: "capped-cpu",
    memory_cap_property: "swap",
    memory_alignment_mb: None,
    supports_suspend: false,
    supports_live_migration: false,
    supports_remote_resize: false,
    supports_volume_hotplug: false,
    anet_name_property: "linkname",
    default_anet: ("linkname", "net0"),
    global_properties: &["file-mac-profile", "fs-allowed", "limitpriv"],
};

const KERNEL: Capabilities = Capabilities {
    template: "SYSsolaris-kz",
    cpu_resource: "virtual-cpu",
    memory_cap_property: "physical",
    memory_alignment_mb: Some(256),
    supports_suspend: true,
    supports_live_migration: true,
    supports_remote_resize: true,
    supports_volume_hotplug: true,
    anet_name_property: "id",
    default_anet: ("id", "0"),
    global_properties: &["cpu-arch"],
};

/// Global properties any brand accepts from a flavor.
pub const COMMON_GLOBAL_PROPERTIES: &[&str] = &["bootargs", "brand", "hostid"];

impl Brand {
    pub fn capabilities(self) -> &'static Capabilities {
        match self {
            Brand::Native => &NATIVE,
            Brand::Kernel => &KERNEL,
        }
    }

    /// Returns true if a flavor may set the global property `prop`.
    pub fn allows_global_property(self, prop: &str) -> bool {
        COMMON_GLOBAL_PROPERTIES.contains(&prop)
            || self.capabilities().global_properties.contains(&prop)
    }

    /// Returns the datalink name of an anet, given its naming property.
    pub fn anet_link_name(self, value: &str) -> String {
        match self {
            Brand::Native => value.to_string(),
            Brand::Kernel => format!("net{value}"),
        }
    }
}

/// The state of a zone as reported by the backend.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum State {
    Configured,
    Incomplete,
    Unavailable,
    Installed,
    Ready,
    Running,
    ShuttingDown,
    Down,
    Mounted,
}

/// The coarse power state of an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PowerState {
    NoState,
    Running,
    Shutdown,
}

impl State {
    pub fn power_state(self) -> PowerState {
        match self {
            State::Installed => PowerState::Shutdown,
            State::Ready
            | State::Running
            | State::ShuttingDown
            | State::Down => PowerState::Running,
            State::Configured
            | State::Incomplete
            | State::Unavailable
            | State::Mounted => PowerState::NoState,
        }
    }
}

/// A property value, either a single string or a list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PropertyValue {
    Simple(String),
    List(Vec<String>),
}

impl PropertyValue {
    /// The value as a single string; lists are rendered comma separated.
    pub fn as_string(&self) -> String {
        match self {
            PropertyValue::Simple(v) => v.clone(),
            PropertyValue::List(vs) => vs.join(","),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Property {
    pub name: String,
    pub value: PropertyValue,
}

impl Property {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: PropertyValue::Simple(value.into()) }
    }

    pub fn list(name: impl Into<String>, values: Vec<String>) -> Self {
        Self { name: name.into(), value: PropertyValue::List(values) }
    }

    /// A property with no value, used to name properties to read or clear.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, "")
    }

    pub fn value(&self) -> String {
        self.value.as_string()
    }
}

/// A configuration resource, or a filter selecting resources.
///
/// As a filter, every listed property must match for a resource to be
/// selected; an empty property list selects every resource of the kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resource {
    pub kind: String,
    pub properties: Vec<Property>,
}

impl Resource {
    pub fn new(kind: impl Into<String>, properties: Vec<Property>) -> Self {
        Self { kind: kind.into(), properties }
    }

    /// A filter matching every resource of `kind`.
    pub fn kind(kind: impl Into<String>) -> Self {
        Self::new(kind, vec![])
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Returns true if this resource satisfies `filter`.
    pub fn matches(&self, filter: &Resource) -> bool {
        self.kind == filter.kind
            && filter.properties.iter().all(|f| {
                self.properties
                    .iter()
                    .any(|p| p.name == f.name && p.value == f.value)
            })
    }
}

/// Error codes carried in a backend error payload.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    None,
    FrameworkError,
    SnapshotError,
    CommandError,
    ResourceAlreadyExists,
    ResourceNotFound,
    ResourceTooMany,
    ResourceUnknown,
    AlreadyEditing,
    PropertyUnknown,
    NotEditing,
    SystemError,
    InvalidArgument,
    InvalidZoneState,
}

/// A structured error reported by the zone backend.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub struct ZoneError {
    pub code: ErrorCode,
    pub message: Option<String>,
    pub stderr: Option<String>,
}

impl ZoneError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: Some(message.into()), stderr: None }
    }

    /// An error without a structured payload, such as a lost connection.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::None, message)
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = Some(stderr.into());
        self
    }

    /// Returns true for codes a lookup treats as "absent".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::ResourceNotFound
                | ErrorCode::ResourceUnknown
                | ErrorCode::PropertyUnknown
        )
    }
}

impl fmt::Display for ZoneError {
    /// Formats the payload as a single line: the code, then the message,
    /// then stderr with newlines folded into ": ".
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code == ErrorCode::None {
            return write!(
                f,
                "{}",
                self.message.as_deref().unwrap_or("zone backend error")
            );
        }
        let mut parts = vec![self.code.to_string()];
        if let Some(message) = self.message.as_deref().filter(|m| !m.is_empty())
        {
            parts.push(message.to_string());
        }
        if let Some(stderr) = self.stderr.as_deref() {
            let stderr = stderr.trim_end();
            if !stderr.is_empty() {
                parts.push(stderr.replace('\n', ": "));
            }
        }
        write!(f, "{}", parts.join(": "))
    }
}

/// A point-in-time view of a zone.
///
/// This is never cached across operations: state is re-read from the
/// backend whenever it matters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Zone {
    pub name: String,
    pub id: Option<i32>,
    pub brand: String,
    pub state: State,
}

impl Zone {
    pub fn brand(&self) -> Option<Brand> {
        Brand::from_str(&self.brand).ok()
    }

    pub fn power_state(&self) -> PowerState {
        self.state.power_state()
    }
}

/// The zone backend protocol.
///
/// Configuration reads made while an edit session is open observe the
/// session's pending edits; every other reader sees committed state.
#[async_trait]
pub trait ZoneManager: Send + Sync {
    /// Returns true once the backend connection is no longer usable.
    fn is_closed(&self) -> bool {
        false
    }

    /// Lists zones whose names match a glob-style pattern.
    async fn list(&self, pattern: &str) -> Result<Vec<Zone>, ZoneError>;

    async fn create(&self, name: &str, template: &str)
        -> Result<(), ZoneError>;
    async fn delete(&self, name: &str) -> Result<(), ZoneError>;

    async fn edit_config(&self, name: &str) -> Result<(), ZoneError>;
    async fn commit_config(&self, name: &str) -> Result<(), ZoneError>;
    async fn cancel_config(&self, name: &str) -> Result<(), ZoneError>;

    async fn get_resources(
        &self,
        name: &str,
        filter: &Resource,
    ) -> Result<Vec<Resource>, ZoneError>;
    async fn get_resource_properties(
        &self,
        name: &str,
        filter: &Resource,
        properties: &[&str],
    ) -> Result<Vec<Property>, ZoneError>;
    async fn add_resource(
        &self,
        name: &str,
        resource: &Resource,
    ) -> Result<(), ZoneError>;
    async fn set_resource_properties(
        &self,
        name: &str,
        filter: &Resource,
        properties: &[Property],
    ) -> Result<(), ZoneError>;
    async fn remove_resources(
        &self,
        name: &str,
        filter: &Resource,
    ) -> Result<(), ZoneError>;
    async fn clear_resource_properties(
        &self,
        name: &str,
        filter: &Resource,
        properties: &[&str],
    ) -> Result<(), ZoneError>;
    async fn export_config(&self, name: &str) -> Result<String, ZoneError>;

    async fn install(&self, name: &str, options: &[String])
        -> Result<(), ZoneError>;
    async fn uninstall(
        &self,
        name: &str,
        options: &[String],
    ) -> Result<(), ZoneError>;
    async fn attach(&self, name: &str, options: &[String])
        -> Result<(), ZoneError>;
    async fn detach(&self, name: &str, options: &[String])
        -> Result<(), ZoneError>;
    async fn boot(&self, name: &str, options: &[String])
        -> Result<(), ZoneError>;
    async fn shutdown(
        &self,
        name: &str,
        options: &[String],
    ) -> Result<(), ZoneError>;
    async fn halt(&self, name: &str) -> Result<(), ZoneError>;
    async fn reboot(&self, name: &str, options: &[String])
        -> Result<(), ZoneError>;
    async fn suspend(&self, name: &str) -> Result<(), ZoneError>;
    async fn migrate(
        &self,
        name: &str,
        options: &[String],
    ) -> Result<(), ZoneError>;
    /// Applies the committed configuration to a running zone.
    async fn apply(&self, name: &str) -> Result<(), ZoneError>;
}

/// Establishes connections to the zone backend.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn ZoneManager>, ZoneError>;
}

/// A connector which always hands out the same backend.
pub struct FixedConnector(pub Arc<dyn ZoneManager>);

#[async_trait]
impl Connector for FixedConnector {
    async fn connect(&self) -> Result<Arc<dyn ZoneManager>, ZoneError> {
        Ok(self.0.clone())
    }
}

/// Owns the connection to the zone backend, reconnecting when the current
/// connection has been closed underneath us.
pub struct ConnectionManager {
    log: Logger,
    connector: Box<dyn Connector>,
    current: Mutex<Option<Arc<dyn ZoneManager>>>,
}

impl ConnectionManager {
    pub fn new(log: &Logger, connector: Box<dyn Connector>) -> Arc<Self> {
        Arc::new(Self {
            log: log.new(slog::o!("component" => "ConnectionManager")),
            connector,
            current: Mutex::new(None),
        })
    }

    /// Builds a manager around a single backend.
    pub fn fixed(log: &Logger, zones: Arc<dyn ZoneManager>) -> Arc<Self> {
        Self::new(log, Box::new(FixedConnector(zones)))
    }

    /// Returns a live connection, establishing a new one if needed.
    pub async fn zones(&self) -> Result<Arc<dyn ZoneManager>, ZoneError> {
        let mut current = self.current.lock().await;
        if let Some(zones) = current.as_ref() {
            if !zones.is_closed() {
                return Ok(zones.clone());
            }
            warn!(self.log, "zone backend connection closed; reconnecting");
        } else {
            info!(self.log, "connecting to zone backend");
        }
        let zones = self.connector.connect().await?;
        *current = Some(zones.clone());
        Ok(zones)
    }

    /// Looks up a zone by exact name.
    pub async fn find_zone(
        &self,
        name: &str,
    ) -> Result<Option<Zone>, ZoneError> {
        let zones = self.zones().await?;
        let found = zones.list(name).await?;
        Ok(found.into_iter().find(|z| z.name == name))
    }

    /// Lists every zone the backend knows about.
    pub async fn list_zones(&self) -> Result<Vec<Zone>, ZoneError> {
        self.zones().await?.list("*").await
    }
}

/// Returns the first resource of `kind`, if any.
pub async fn lookup_resource(
    zones: &dyn ZoneManager,
    name: &str,
    kind: &str,
) -> Result<Option<Resource>, ZoneError> {
    match zones.get_resources(name, &Resource::kind(kind)).await {
        Ok(found) => Ok(found.into_iter().next()),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

/// Returns the value of `prop` on the first resource selected by `filter`.
pub async fn lookup_resource_property(
    zones: &dyn ZoneManager,
    name: &str,
    filter: &Resource,
    prop: &str,
) -> Result<Option<String>, ZoneError> {
    match zones.get_resource_properties(name, filter, &[prop]).await {
        Ok(found) => Ok(found.into_iter().next().map(|p| p.value())),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

/// Returns the first resource of `kind` whose `prop` equals `value`.
pub async fn lookup_resource_property_value(
    zones: &dyn ZoneManager,
    name: &str,
    kind: &str,
    prop: &str,
    value: &str,
) -> Result<Option<Resource>, ZoneError> {
    let resources = match zones.get_resources(name, &Resource::kind(kind)).await
    {
        Ok(found) => found,
        Err(err) if err.is_not_found() => return Ok(None),
        Err(err) => return Err(err),
    };
    Ok(resources.into_iter().find(|r| {
        r.properties.iter().any(|p| p.name == prop && p.value() == value)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::zone::FakeZoneManager;
    use crate::test_log;

    #[test]
    fn power_state_mapping() {
        assert_eq!(State::Installed.power_state(), PowerState::Shutdown);
        for s in [State::Ready, State::Running, State::ShuttingDown, State::Down]
        {
            assert_eq!(s.power_state(), PowerState::Running);
        }
        for s in [
            State::Configured,
            State::Incomplete,
            State::Unavailable,
            State::Mounted,
        ] {
            assert_eq!(s.power_state(), PowerState::NoState);
        }
        assert_eq!(
            State::from_str("shutting_down").unwrap(),
            State::ShuttingDown
        );
    }

    #[test]
    fn brands_without_templates_are_rejected() {
        assert_eq!(Brand::from_str("solaris").unwrap(), Brand::Native);
        assert_eq!(Brand::from_str("solaris-kz").unwrap(), Brand::Kernel);
        assert!(Brand::from_str("labeled").is_err());
        assert!(Brand::from_str("solaris10").is_err());
    }

    #[test]
    fn brand_capabilities() {
        let kz = Brand::Kernel.capabilities();
        assert_eq!(kz.memory_alignment_mb, Some(256));
        assert_eq!(kz.cpu_resource, "virtual-cpu");
        assert!(Brand::Kernel.allows_global_property("cpu-arch"));
        assert!(!Brand::Kernel.allows_global_property("limitpriv"));
        assert!(Brand::Native.allows_global_property("limitpriv"));
        assert!(Brand::Native.allows_global_property("hostid"));
        assert_eq!(Brand::Kernel.anet_link_name("3"), "net3");
        assert_eq!(Brand::Native.anet_link_name("net0"), "net0");
    }

    #[test]
    fn error_formatting() {
        let err = ZoneError::new(ErrorCode::CommandError, "boot failed")
            .with_stderr("line one\nline two\n");
        assert_eq!(
            err.to_string(),
            "COMMAND_ERROR: boot failed: line one: line two"
        );

        let err = ZoneError {
            code: ErrorCode::InvalidZoneState,
            message: Some(String::new()),
            stderr: None,
        };
        assert_eq!(err.to_string(), "INVALID_ZONE_STATE");

        let err = ZoneError::transport("connection reset");
        assert_eq!(err.to_string(), "connection reset");
    }

    #[test]
    fn resource_filters() {
        let anet = Resource::new(
            "anet",
            vec![Property::new("id", "0"), Property::new("mtu", "1500")],
        );
        assert!(anet.matches(&Resource::kind("anet")));
        assert!(anet
            .matches(&Resource::new("anet", vec![Property::new("id", "0")])));
        assert!(!anet
            .matches(&Resource::new("anet", vec![Property::new("id", "1")])));
        assert!(!anet.matches(&Resource::kind("device")));
    }

    #[tokio::test]
    async fn connection_manager_reconnects_closed_backend() {
        let log = test_log("connection_manager_reconnects_closed_backend");
        let first = FakeZoneManager::new();
        first.create("z1", "SYSdefault").await.unwrap();
        first.close();

        struct Sequence {
            first: Arc<FakeZoneManager>,
            second: Arc<FakeZoneManager>,
            calls: std::sync::atomic::AtomicUsize,
        }
        #[async_trait]
        impl Connector for Sequence {
            async fn connect(
                &self,
            ) -> Result<Arc<dyn ZoneManager>, ZoneError> {
                let n = self
                    .calls
                    .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if n == 0 {
                    Ok(self.first.clone())
                } else {
                    Ok(self.second.clone())
                }
            }
        }

        let second = FakeZoneManager::new();
        second.create("z2", "SYSdefault").await.unwrap();
        let mgr = ConnectionManager::new(
            &log,
            Box::new(Sequence {
                first: first.clone(),
                second: second.clone(),
                calls: std::sync::atomic::AtomicUsize::new(0),
            }),
        );

        // The first connection is already closed, so the lookup must be
        // served by the replacement.
        assert!(mgr.find_zone("z1").await.unwrap().is_none());
        let z2 = mgr.find_zone("z2").await.unwrap().unwrap();
        assert_eq!(z2.state, State::Configured);
        assert_eq!(z2.brand(), Some(Brand::Native));
    }
}
