//! Remote command strings
//!
//! These are opaque to the rest of the crate; only the output contract
//! documented on each constant is relied upon.

/// Field separator in [`INVENTORY`] output
pub const FIELD_SEPARATOR: char = '|';

/// One line per container:
/// `id|name|image|status|running|restart_policy|created`
pub const INVENTORY: &str = "docker ps -aq --no-trunc | xargs -r docker inspect --format \
    '{{.Id}}|{{.Name}}|{{.Config.Image}}|{{.State.Status}}|{{.State.Running}}|{{.HostConfig.RestartPolicy.Name}}|{{.Created}}'";

/// Number of fields on an [`INVENTORY`] line
pub const INVENTORY_FIELDS: usize = 7;

/// A single integer
pub const CPU_CORES: &str = "nproc";

/// `free -b` table; the `Mem:` row carries total and used bytes
pub const MEMORY: &str = "free -b";

/// POSIX `df` table for the root filesystem in bytes
pub const DISK: &str = "df -P -B1 /";

/// Seconds since boot as the first token
pub const UPTIME: &str = "cat /proc/uptime";
