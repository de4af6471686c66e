//! Detecting whether this process itself runs inside a container.

use std::path::Path;

/// Set to a non-empty value (other than `0`/`false`) to force container mode.
pub const CONTAINER_ENV: &str = "CONTAINER_ENV";

const MARKER_FILES: [&str; 2] = ["/.dockerenv", "/run/.containerenv"];
const CGROUP_HINTS: [&str; 3] = ["docker", "lxc", "kubepods"];

/// Whether the current process runs inside a container.
///
/// Discovery is pointless there: the backend is reached on a static address.
#[must_use]
pub fn running_in_container() -> bool {
    if let Ok(value) = std::env::var(CONTAINER_ENV) {
        return flag_set(&value);
    }
    if MARKER_FILES.iter().any(|m| Path::new(m).exists()) {
        return true;
    }
    std::fs::read_to_string("/proc/1/cgroup").is_ok_and(|cgroup| cgroup_is_container(&cgroup))
}

fn flag_set(value: &str) -> bool {
    let value = value.trim();
    !(value.is_empty() || value == "0" || value.eq_ignore_ascii_case("false"))
}

fn cgroup_is_container(cgroup: &str) -> bool {
    CGROUP_HINTS.iter().any(|hint| cgroup.contains(hint))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_values() {
        assert!(flag_set("1"));
        assert!(flag_set("docker"));
        assert!(!flag_set(""));
        assert!(!flag_set("0"));
        assert!(!flag_set("FALSE"));
    }

    #[test]
    fn test_cgroup_hints() {
        assert!(cgroup_is_container("12:pids:/docker/4f1c2d"));
        assert!(cgroup_is_container("0::/kubepods/burstable/pod1"));
        assert!(!cgroup_is_container("0::/init.scope"));
    }
}
