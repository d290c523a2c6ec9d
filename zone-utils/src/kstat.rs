// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reading zone statistics from the kernel statistics facility.
//!
//! Per-CPU usage of a zone is only meaningful if the zone's CPU set did not
//! change while it was being read. The accumulator kstat carries a
//! generation number which moves whenever CPUs leave the set (folding their
//! usage into the accumulator), so a read is accepted only when the
//! generation number observed before and after it agree.

use crate::backoff::{retry_notify, BackoffError, FixedAttempts};
use crate::executor::Executor;
use crate::zone::{ConnectionManager, State, Zone, ZoneError};
use crate::{ExecutionError, KSTAT};

use async_trait::async_trait;
use slog::{error, warn, Logger};
use slog_error_chain::InlineErrorChain;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A statistic value, or a nested kstat.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KstatValue {
    Integer(i64),
    String(String),
    Kstat(KstatData),
}

impl KstatValue {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            KstatValue::Integer(v) => Some(*v),
            _ => None,
        }
    }
}

/// The statistics of one kstat, with nested kstats keyed by the next URI
/// path component.
pub type KstatData = BTreeMap<String, KstatValue>;

/// Accumulator children which are not CPUs.
const NON_CPU_CHILDREN: &[&str] = &["accum", "pset_accum"];

/// Resource caps reported in diagnostics.
const CAP_STATS: &[&str] = &["lockedmem", "nprocs", "swapresv"];

#[derive(thiserror::Error, Debug)]
pub enum StatError {
    #[error("zone '{zone}' is not running")]
    NotRunning { zone: String },

    #[error("kstat '{uri}' is not available")]
    Unavailable { uri: String },

    #[error("CPU set of zone '{zone}' changed while reading statistics")]
    ConsistencyRace { zone: String },

    #[error(
        "Gave up reading statistics of zone '{zone}' after {attempts} attempts"
    )]
    MaxRetriesExceeded { zone: String, attempts: usize },

    #[error("Failed to read kstat '{uri}': {err}")]
    Read {
        uri: String,
        #[source]
        err: ExecutionError,
    },

    #[error("kstat '{uri}' statistic '{stat}' is not an integer")]
    NotInteger { uri: String, stat: String },

    #[error(transparent)]
    Zone(#[from] ZoneError),
}

/// Reads kstats by URI.
#[async_trait]
pub trait KstatReader: Send + Sync {
    /// Returns the kstat at `uri`, or `None` if it does not exist.
    async fn read(&self, uri: &str) -> Result<Option<KstatData>, StatError>;
}

/// Reads kstats with `kstat -p`.
///
/// Each output line is `<uri>:<statistic>\t<value>`; lines for kstats below
/// the requested URI are nested under their relative path.
pub struct KstatCli {
    executor: Arc<dyn Executor>,
}

impl KstatCli {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl KstatReader for KstatCli {
    async fn read(&self, uri: &str) -> Result<Option<KstatData>, StatError> {
        let mut command = tokio::process::Command::new(KSTAT);
        command.args([
            "-p".to_string(),
            uri.to_string(),
            format!("{uri}/*"),
            format!("{uri}/*/*"),
        ]);
        let output = match self.executor.execute_async(&mut command).await {
            Ok(output) => output,
            // kstat exits non-zero when nothing matched.
            Err(ExecutionError::CommandFailure(info))
                if info.stdout.trim().is_empty() =>
            {
                return Ok(None);
            }
            Err(err) => {
                return Err(StatError::Read { uri: uri.to_string(), err })
            }
        };
        Ok(parse_kstat_output(uri, &String::from_utf8_lossy(&output.stdout)))
    }
}

/// Groups `kstat -p` output into the kstat at `uri` and its descendants.
pub fn parse_kstat_output(uri: &str, text: &str) -> Option<KstatData> {
    let mut root = KstatData::new();
    let mut found = false;
    'lines: for line in text.lines() {
        let Some((key, value)) = line.split_once('\t') else {
            continue;
        };
        let Some((kstat, stat)) = key.rsplit_once(':') else {
            continue;
        };
        let Some(relative) = kstat.strip_prefix(uri) else {
            continue;
        };
        if !relative.is_empty() && !relative.starts_with('/') {
            continue;
        }
        found = true;
        let mut node = &mut root;
        for component in relative.split('/').filter(|c| !c.is_empty()) {
            if !matches!(node.get(component), Some(KstatValue::Kstat(_))) {
                node.insert(
                    component.to_string(),
                    KstatValue::Kstat(KstatData::new()),
                );
            }
            let Some(KstatValue::Kstat(child)) = node.get_mut(component)
            else {
                continue 'lines;
            };
            node = child;
        }
        let value = value.trim();
        let value = value
            .parse::<i64>()
            .map(KstatValue::Integer)
            .unwrap_or_else(|_| KstatValue::String(value.to_string()));
        node.insert(stat.to_string(), value);
    }
    found.then_some(root)
}

fn children(data: &KstatData) -> impl Iterator<Item = (&String, &KstatData)> {
    data.iter().filter_map(|(name, value)| match value {
        KstatValue::Kstat(child) => Some((name, child)),
        _ => None,
    })
}

fn integer(data: &KstatData, stat: &str) -> i64 {
    data.get(stat).and_then(KstatValue::as_integer).unwrap_or(0)
}

fn zone_uri(zone: &str) -> String {
    format!("kstat:/zones/{zone}/cpu")
}

/// Collects zone statistics.
pub struct StatCollector {
    log: Logger,
    zones: Arc<ConnectionManager>,
    reader: Arc<dyn KstatReader>,
    policy: FixedAttempts,
}

impl StatCollector {
    pub fn new(
        log: &Logger,
        zones: Arc<ConnectionManager>,
        reader: Arc<dyn KstatReader>,
    ) -> Self {
        Self::with_policy(
            log,
            zones,
            reader,
            crate::backoff::stat_read_policy(),
        )
    }

    pub fn with_policy(
        log: &Logger,
        zones: Arc<ConnectionManager>,
        reader: Arc<dyn KstatReader>,
        policy: FixedAttempts,
    ) -> Self {
        Self {
            log: log.new(slog::o!("component" => "StatCollector")),
            zones,
            reader,
            policy,
        }
    }

    /// Returns the CPU time consumed by a running zone, in nanoseconds.
    ///
    /// Statistics are advisory: any failure is logged and reported as 0.
    pub async fn cpu_time_nanos(&self, zone: &Zone) -> u64 {
        if zone.state != State::Running {
            return 0;
        }
        let name = zone.name.as_str();
        let attempt = || async {
            self.read_cpu_time(name).await.map_err(classify)
        };
        match retry_notify(self.policy.clone(), attempt, self.notify(name))
            .await
        {
            Ok(nanos) => u64::try_from(nanos).unwrap_or(0),
            Err(StatError::NotRunning { .. }) => 0,
            Err(err) => {
                error!(
                    self.log,
                    "failed to read zone CPU time";
                    "zone" => name,
                    "error" => InlineErrorChain::new(&err),
                );
                0
            }
        }
    }

    async fn read_cpu_time(&self, name: &str) -> Result<i64, StatError> {
        let accum_uri = format!("{}/accum/sys", zone_uri(name));
        let initial = self.read_required(name, &accum_uri).await?;

        let mut total = 0;
        for cpu in self.cpu_ids(name).await? {
            let uri = format!("{}/{cpu}", zone_uri(name));
            let data = self.read_required(name, &uri).await?;
            for (_, child) in children(&data) {
                total += integer(child, "cpu_nsec_kernel_cur")
                    + integer(child, "cpu_nsec_user_cur");
            }
        }

        let last = self.read_required(name, &accum_uri).await?;
        if integer(&initial, "gen_num") != integer(&last, "gen_num") {
            return Err(StatError::ConsistencyRace { zone: name.to_string() });
        }
        Ok(total
            + integer(&initial, "cpu_nsec_user")
            + integer(&initial, "cpu_nsec_kernel"))
    }

    /// Returns resource cap usage and per-CPU totals of a running zone.
    ///
    /// Unlike [StatCollector::cpu_time_nanos], failing to get a consistent
    /// read is an error.
    pub async fn diagnostics(
        &self,
        zone: &Zone,
    ) -> Result<Option<BTreeMap<String, i64>>, StatError> {
        let (State::Running, Some(id)) = (zone.state, zone.id) else {
            return Ok(None);
        };
        let name = zone.name.as_str();

        let mut diagnostics = BTreeMap::new();
        for stat in CAP_STATS {
            let uri = format!("kstat:/zone_caps/caps/{stat}_zone_{id}/{id}");
            if let Some(data) = self.reader.read(&uri).await? {
                diagnostics.insert(stat.to_string(), integer(&data, "usage"));
            }
        }

        let attempt = || async {
            self.read_cpu_diagnostics(name).await.map_err(classify)
        };
        match retry_notify(self.policy.clone(), attempt, self.notify(name))
            .await
        {
            Ok(cpu) => diagnostics.extend(cpu),
            Err(StatError::NotRunning { .. }) => return Ok(None),
            Err(StatError::ConsistencyRace { .. })
            | Err(StatError::Unavailable { .. }) => {
                return Err(StatError::MaxRetriesExceeded {
                    zone: name.to_string(),
                    attempts: self.policy.attempts(),
                });
            }
            Err(err) => return Err(err),
        }
        Ok(Some(diagnostics))
    }

    async fn read_cpu_diagnostics(
        &self,
        name: &str,
    ) -> Result<BTreeMap<String, i64>, StatError> {
        let accum_uri = format!("{}/accum/sys", zone_uri(name));
        let initial = self.read_required(name, &accum_uri).await?;

        let mut totals = BTreeMap::<String, i64>::new();
        for cpu in self.cpu_ids(name).await? {
            let uri = format!("{}/{cpu}/sys", zone_uri(name));
            let data = self.read_required(name, &uri).await?;
            for (stat, value) in &data {
                let Some(key) = stat.strip_suffix("_cur") else {
                    continue;
                };
                let value = value.as_integer().ok_or_else(|| {
                    StatError::NotInteger { uri: uri.clone(), stat: stat.clone() }
                })?;
                *totals.entry(key.to_string()).or_default() += value;
            }
        }

        let last = self.read_required(name, &accum_uri).await?;
        if integer(&initial, "gen_num") != integer(&last, "gen_num") {
            return Err(StatError::ConsistencyRace { zone: name.to_string() });
        }
        for (key, total) in totals.iter_mut() {
            *total += integer(&initial, key);
        }
        Ok(totals)
    }

    /// Sums `field` over the child kstats of each of `uris`.
    ///
    /// Missing kstats contribute nothing; an unreadable value makes the
    /// whole aggregate 0.
    pub async fn aggregate_stat(&self, uris: &[String], field: &str) -> i64 {
        let mut total = 0i64;
        for uri in uris {
            let data = match self.reader.read(uri).await {
                Ok(Some(data)) => data,
                Ok(None) => continue,
                Err(err) => {
                    error!(
                        self.log,
                        "failed to read kstat";
                        "uri" => uri,
                        "error" => InlineErrorChain::new(&err),
                    );
                    return 0;
                }
            };
            for (child, values) in children(&data) {
                match values.get(field) {
                    None => {}
                    Some(KstatValue::Integer(v)) => total += v,
                    Some(other) => {
                        error!(
                            self.log,
                            "cannot aggregate non-integer statistic";
                            "uri" => uri,
                            "kstat" => child,
                            "field" => field,
                            "value" => ?other,
                        );
                        return 0;
                    }
                }
            }
        }
        total
    }

    async fn cpu_ids(&self, name: &str) -> Result<Vec<String>, StatError> {
        let uri = zone_uri(name);
        let data = self.read_required(name, &uri).await?;
        Ok(children(&data)
            .map(|(cpu, _)| cpu.clone())
            .filter(|cpu| !NON_CPU_CHILDREN.contains(&cpu.as_str()))
            .collect())
    }

    /// Reads a kstat which must exist while the zone runs.
    async fn read_required(
        &self,
        name: &str,
        uri: &str,
    ) -> Result<KstatData, StatError> {
        if let Some(data) = self.reader.read(uri).await? {
            return Ok(data);
        }
        let running = self
            .zones
            .find_zone(name)
            .await?
            .is_some_and(|z| z.state == State::Running);
        if running {
            Err(StatError::Unavailable { uri: uri.to_string() })
        } else {
            Err(StatError::NotRunning { zone: name.to_string() })
        }
    }

    fn notify<'a>(
        &'a self,
        name: &'a str,
    ) -> impl FnMut(StatError, std::time::Duration) + 'a {
        move |err, _delay| {
            warn!(
                self.log,
                "retrying zone statistics read";
                "zone" => name,
                "reason" => %err,
            );
        }
    }
}

fn classify(err: StatError) -> BackoffError<StatError> {
    match err {
        StatError::ConsistencyRace { .. } | StatError::Unavailable { .. } => {
            BackoffError::transient(err)
        }
        _ => BackoffError::permanent(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{output_success, FakeExecutor};
    use crate::fakes::kstat::FakeKstat;
    use crate::fakes::zone::FakeZoneManager;
    use crate::test_log;
    use crate::zone::ZoneManager;
    use std::time::Duration;

    fn kstat(values: &[(&str, i64)]) -> KstatData {
        values
            .iter()
            .map(|(k, v)| (k.to_string(), KstatValue::Integer(*v)))
            .collect()
    }

    fn nested(children: Vec<(&str, KstatData)>) -> KstatData {
        children
            .into_iter()
            .map(|(k, v)| (k.to_string(), KstatValue::Kstat(v)))
            .collect()
    }

    async fn running_zone(
        name: &str,
    ) -> (Arc<FakeZoneManager>, Arc<ConnectionManager>, Zone) {
        let log = test_log(name);
        let fake = FakeZoneManager::new();
        fake.create(name, "SYSsolaris-kz").await.unwrap();
        fake.install(name, &[]).await.unwrap();
        fake.boot(name, &[]).await.unwrap();
        let conn = ConnectionManager::fixed(&log, fake.clone());
        let zone = conn.find_zone(name).await.unwrap().unwrap();
        (fake, conn, zone)
    }

    /// Two CPUs plus the accumulators, with a stable generation number.
    fn populate(stats: &FakeKstat, zone: &str) {
        let base = format!("kstat:/zones/{zone}/cpu");
        stats.insert(
            &base,
            nested(vec![
                ("0", KstatData::new()),
                ("1", KstatData::new()),
                ("accum", KstatData::new()),
                ("pset_accum", KstatData::new()),
            ]),
        );
        stats.insert(
            &format!("{base}/accum/sys"),
            kstat(&[
                ("gen_num", 7),
                ("cpu_nsec_user", 100),
                ("cpu_nsec_kernel", 10),
            ]),
        );
        for (cpu, user, kernel) in [("0", 1000, 200), ("1", 3000, 400)] {
            let sys = kstat(&[
                ("cpu_nsec_user_cur", user),
                ("cpu_nsec_kernel_cur", kernel),
                ("cpu_ticks_idle", 5),
            ]);
            stats.insert(
                &format!("{base}/{cpu}"),
                nested(vec![("sys", sys.clone())]),
            );
            stats.insert(&format!("{base}/{cpu}/sys"), sys);
        }
    }

    #[tokio::test]
    async fn cpu_time_sums_cpus_and_accumulator() {
        let (_fake, conn, zone) = running_zone("cpu-stable").await;
        let stats = FakeKstat::new();
        populate(&stats, "cpu-stable");
        let collector = StatCollector::new(
            &test_log("cpu_time_sums_cpus_and_accumulator"),
            conn,
            stats.clone(),
        );
        assert_eq!(
            collector.cpu_time_nanos(&zone).await,
            1000 + 200 + 3000 + 400 + 100 + 10
        );
    }

    #[tokio::test]
    async fn changing_generation_degrades_cpu_time_but_fails_diagnostics() {
        let (_fake, conn, zone) = running_zone("cpu-racing").await;
        let stats = FakeKstat::new();
        populate(&stats, "cpu-racing");
        let accum = "kstat:/zones/cpu-racing/cpu/accum/sys";
        stats.set_sequence(
            accum,
            (0..20).map(|gen| kstat(&[("gen_num", gen)])).collect(),
        );
        let collector = StatCollector::with_policy(
            &test_log("changing_generation"),
            conn,
            stats.clone(),
            FixedAttempts::new(3, Duration::ZERO),
        );

        assert_eq!(collector.cpu_time_nanos(&zone).await, 0);
        // Each attempt reads the accumulator twice.
        assert_eq!(stats.reads(accum), 6);

        let err = collector.diagnostics(&zone).await.unwrap_err();
        assert!(matches!(
            err,
            StatError::MaxRetriesExceeded { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn diagnostics_reports_caps_and_cpu_totals() {
        let (_fake, conn, zone) = running_zone("diag").await;
        let id = zone.id.unwrap();
        let stats = FakeKstat::new();
        populate(&stats, "diag");
        stats.insert(
            &format!("kstat:/zone_caps/caps/nprocs_zone_{id}/{id}"),
            kstat(&[("usage", 42)]),
        );
        let collector =
            StatCollector::new(&test_log("diagnostics"), conn, stats.clone());
        let diag = collector.diagnostics(&zone).await.unwrap().unwrap();
        assert_eq!(diag["nprocs"], 42);
        assert!(!diag.contains_key("lockedmem"));
        assert_eq!(diag["cpu_nsec_user"], 1000 + 3000 + 100);
        assert_eq!(diag["cpu_nsec_kernel"], 200 + 400 + 10);
        assert!(!diag.contains_key("cpu_ticks_idle"));
    }

    #[tokio::test]
    async fn stopped_zone_reports_nothing() {
        let (fake, conn, zone) = running_zone("stopped").await;
        fake.halt("stopped").await.unwrap();
        let stats = FakeKstat::new();
        let collector = StatCollector::new(
            &test_log("stopped"),
            conn.clone(),
            stats.clone(),
        );

        // The zone went away between listing and reading.
        assert_eq!(collector.cpu_time_nanos(&zone).await, 0);
        assert_eq!(stats.reads("kstat:/zones/stopped/cpu/accum/sys"), 1);

        let zone = conn.find_zone("stopped").await.unwrap().unwrap();
        assert_eq!(collector.cpu_time_nanos(&zone).await, 0);
        assert!(collector.diagnostics(&zone).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn aggregate_sums_children() {
        let (_fake, conn, _zone) = running_zone("aggregate").await;
        let stats = FakeKstat::new();
        stats.insert(
            "kstat:/net/link/a",
            nested(vec![
                ("0", kstat(&[("rbytes", 5)])),
                ("1", kstat(&[("rbytes", 7)])),
            ]),
        );
        stats.insert(
            "kstat:/net/link/b",
            nested(vec![("0", kstat(&[("rbytes", 1)]))]),
        );
        let collector =
            StatCollector::new(&test_log("aggregate"), conn, stats.clone());
        let uris = vec![
            "kstat:/net/link/a".to_string(),
            "kstat:/net/link/b".to_string(),
            "kstat:/net/link/missing".to_string(),
        ];
        assert_eq!(collector.aggregate_stat(&uris, "rbytes").await, 13);

        let mut bad = KstatData::new();
        bad.insert("rbytes".to_string(), KstatValue::String("n/a".into()));
        stats.insert("kstat:/net/link/c", nested(vec![("0", bad)]));
        let uris = vec![
            "kstat:/net/link/a".to_string(),
            "kstat:/net/link/c".to_string(),
        ];
        assert_eq!(collector.aggregate_stat(&uris, "rbytes").await, 0);
    }

    #[tokio::test]
    async fn cli_reader_nests_descendants() {
        let log = test_log("cli_reader_nests_descendants");
        let executor = FakeExecutor::new(log);
        executor.set_wait_handler(Box::new(|cmd| {
            assert_eq!(cmd.name(), "kstat");
            assert!(cmd.args_start_with(&["-p", "kstat:/zones/z1/cpu"]));
            output_success(
                "kstat:/zones/z1/cpu/0/sys:cpu_nsec_user_cur\t12\n\
                 kstat:/zones/z1/cpu/accum/sys:gen_num\t3\n\
                 kstat:/zones/z1/cpu:crtime\t1.5\n",
            )
        }));
        let reader = KstatCli::new(executor.as_executor());
        let data = reader.read("kstat:/zones/z1/cpu").await.unwrap().unwrap();
        assert_eq!(
            data["crtime"],
            KstatValue::String("1.5".to_string())
        );
        let KstatValue::Kstat(cpu0) = &data["0"] else { panic!() };
        let KstatValue::Kstat(sys) = &cpu0["sys"] else { panic!() };
        assert_eq!(sys["cpu_nsec_user_cur"], KstatValue::Integer(12));
    }
}
