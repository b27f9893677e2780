//! Schema definitions and constants

/// Table names
pub mod tables {
    pub const HOSTS: &str = "hosts";
    pub const INVENTORY_RECORDS: &str = "inventory_records";
    pub const JOBS: &str = "jobs";
    pub const JOB_TARGETS: &str = "job_targets";
    pub const JOB_RUNS: &str = "job_runs";
    pub const ALERT_LOG: &str = "alert_log";

    pub const ALL: &[&str] = &[
        HOSTS,
        INVENTORY_RECORDS,
        JOBS,
        JOB_TARGETS,
        JOB_RUNS,
        ALERT_LOG,
    ];
}

/// Resource id of the per-host facts singleton in `inventory_records`
pub const HOST_FACTS_RESOURCE: &str = "host-facts";
