// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Managing the per-zone console SMF service instances.

use crate::executor::{run, Executor};
use crate::{ExecutionError, SVCADM, SVCCFG, SVCS};

use slog::{debug, error, Logger};
use std::sync::Arc;

pub const CONSOLE_BASE_FMRI: &str =
    "svc:/application/openstack/nova/zone-vnc-console";

#[derive(thiserror::Error, Debug)]
#[error("Failed to delete console service '{fmri}': {err}")]
pub struct ConsoleServiceError {
    fmri: String,
    #[source]
    err: ExecutionError,
}

/// The console service instance of each zone.
pub struct ConsoleService {
    log: Logger,
    executor: Arc<dyn Executor>,
}

impl ConsoleService {
    pub fn new(log: &Logger, executor: Arc<dyn Executor>) -> Self {
        Self {
            log: log.new(slog::o!("component" => "ConsoleService")),
            executor,
        }
    }

    pub fn fmri(zone: &str) -> String {
        format!("{CONSOLE_BASE_FMRI}:{zone}")
    }

    /// Returns true if `zone` has a console service instance.
    pub async fn has(&self, zone: &str) -> bool {
        let fmri = Self::fmri(zone);
        run(&*self.executor, SVCS, ["-H", "-o", "state", fmri.as_str()])
            .await
            .is_ok()
    }

    /// Disables the instance and refreshes it so it forgets its port.
    ///
    /// Failures are logged, not returned.
    pub async fn disable(&self, zone: &str) {
        if !self.has(zone).await {
            debug!(
                self.log,
                "ignoring disable of missing console service"; "zone" => zone
            );
            return;
        }
        let fmri = Self::fmri(zone);
        if let Err(err) =
            run(&*self.executor, SVCADM, ["disable", "-s", fmri.as_str()])
                .await
        {
            error!(
                self.log,
                "unable to disable console service";
                "fmri" => &fmri,
                "reason" => err.stderr().unwrap_or_default().trim(),
            );
        }
        if let Err(err) =
            run(&*self.executor, SVCCFG, ["-s", fmri.as_str(), "refresh"]).await
        {
            error!(
                self.log,
                "unable to refresh console service";
                "fmri" => &fmri,
                "reason" => err.stderr().unwrap_or_default().trim(),
            );
        }
    }

    /// Disables and deletes the instance. Deleting an instance which does
    /// not exist succeeds.
    pub async fn delete(&self, zone: &str) -> Result<(), ConsoleServiceError> {
        self.disable(zone).await;
        let delete = ["-s", CONSOLE_BASE_FMRI, "delete", zone];
        match run(&*self.executor, SVCCFG, delete).await {
            Ok(_) => Ok(()),
            Err(_) if !self.has(zone).await => {
                debug!(
                    self.log,
                    "ignoring delete of missing console service";
                    "zone" => zone,
                );
                Ok(())
            }
            Err(err) => {
                Err(ConsoleServiceError { fmri: Self::fmri(zone), err })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{output_failure, output_success, FakeExecutor};
    use crate::test_log;

    #[tokio::test]
    async fn delete_disables_then_deletes() {
        let log = test_log("delete_disables_then_deletes");
        let executor = FakeExecutor::new(log.clone());
        let service = ConsoleService::new(&log, executor.clone().as_executor());

        service.delete("z1").await.unwrap();
        let commands: Vec<String> =
            executor.history().iter().map(|c| c.to_string()).collect();
        assert_eq!(
            commands,
            vec![
                format!("{SVCS} -H -o state {CONSOLE_BASE_FMRI}:z1"),
                format!("{SVCADM} disable -s {CONSOLE_BASE_FMRI}:z1"),
                format!("{SVCCFG} -s {CONSOLE_BASE_FMRI}:z1 refresh"),
                format!("{SVCCFG} -s {CONSOLE_BASE_FMRI} delete z1"),
            ]
        );
    }

    #[tokio::test]
    async fn missing_service_is_not_an_error() {
        let log = test_log("missing_service_is_not_an_error");
        let executor = FakeExecutor::new(log.clone());
        executor.set_wait_handler(Box::new(|_| {
            output_failure(1, "svcs: Pattern doesn't match any instances\n")
        }));
        let service = ConsoleService::new(&log, executor.clone().as_executor());

        assert!(!service.has("z1").await);
        service.delete("z1").await.unwrap();
        assert!(executor.history().iter().all(|c| c.name() != "svcadm"));
    }

    #[tokio::test]
    async fn failed_delete_of_existing_service_is_reported() {
        let log = test_log("failed_delete_of_existing_service_is_reported");
        let executor = FakeExecutor::new(log.clone());
        executor.set_wait_handler(Box::new(|cmd| {
            if cmd.args.iter().any(|a| a == "delete") {
                output_failure(1, "svccfg: permission denied\n")
            } else {
                output_success("online\n")
            }
        }));
        let service = ConsoleService::new(&log, executor.clone().as_executor());
        let err = service.delete("z1").await.unwrap_err();
        assert!(err.to_string().starts_with(&format!(
            "Failed to delete console service '{CONSOLE_BASE_FMRI}:z1'"
        )));
    }
}
