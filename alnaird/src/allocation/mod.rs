/* -------------------------------------------------------------------------- *\
 *                |   █████╗ ██╗   ██╗██████╗  █████╗ ███████╗ |              *
 *                |  ██╔══██╗██║   ██║██╔══██╗██╔══██╗██╔════╝ |              *
 *                |  ███████║██║   ██║██████╔╝███████║█████╗   |              *
 *                |  ██╔══██║██║   ██║██╔══██╗██╔══██║██╔══╝   |              *
 *                |  ██║  ██║╚██████╔╝██║  ██║██║  ██║███████╗ |              *
 *                |  ╚═╝  ╚═╝ ╚═════╝ ╚═╝  ╚═╝╚═╝  ╚═╝╚══════╝ |              *
 *                +--------------------------------------------+              *
 *                                                                            *
 *                         Distributed Systems Runtime                        *
 * -------------------------------------------------------------------------- *
 * Copyright 2022 - 2024, the aurae contributors                              *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Turns pools of virtual device ids into concrete, locality aware picks.

use crate::slices::{self, SliceError};
use thiserror::Error;
use tracing::warn;

/// Upper bound of a compute allocation, in percent of one device.
pub const MAX_COMPUTE_PERCENTILE: u32 = 100;

pub(crate) type Result<T> = std::result::Result<T, AllocationError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocationError {
    #[error("requested {requested} devices but only {available} are available")]
    InsufficientCapacity { requested: usize, available: usize },
    #[error(transparent)]
    Slice(#[from] SliceError),
}

/// Whether a [Selection] was served by a single physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locality {
    SinglePhysical,
    /// No physical device held enough free slices. The scheduler is expected
    /// to filter such nodes out, so this points at an upstream problem.
    Mixed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub device_ids: Vec<String>,
    pub locality: Locality,
}

/// Picks `count` ids from `available`, preferring ids of one physical
/// device.
///
/// Sorting groups the slices of a device together since the uuid is the
/// prefix. The first window of `count` consecutive ids sharing an owner
/// wins. Without such a window the first `count` ids are returned and the
/// selection is marked [Locality::Mixed].
pub fn select_preferred<S: AsRef<str>>(
    available: &[S],
    count: usize,
) -> Result<Selection> {
    let mut sorted: Vec<&str> = available.iter().map(AsRef::as_ref).collect();
    sorted.sort_unstable();
    sorted.dedup();

    if count > sorted.len() {
        return Err(AllocationError::InsufficientCapacity {
            requested: count,
            available: sorted.len(),
        });
    }

    let owners = sorted
        .iter()
        .map(|id| slices::physical_of(id))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut start = 0;
    while count > 0 && start + count <= sorted.len() {
        let window = start..start + count;
        match window.clone().find(|&i| owners[i] != owners[start]) {
            None => {
                return Ok(Selection {
                    device_ids: to_owned(&sorted[window]),
                    locality: Locality::SinglePhysical,
                })
            }
            // restart at the first id of the next physical device
            Some(next) => start = next,
        }
    }

    if count == 0 {
        return Ok(Selection {
            device_ids: Vec::new(),
            locality: Locality::SinglePhysical,
        });
    }

    warn!(
        available = sorted.len(),
        requested = count,
        "cannot find enough virtual devices within one physical device, assigning mixed devices"
    );

    Ok(Selection {
        device_ids: to_owned(&sorted[..count]),
        locality: Locality::Mixed,
    })
}

/// Physical uuids behind `ids`, each listed once, in sorted order.
pub fn realize<S: AsRef<str>>(
    ids: &[S],
) -> std::result::Result<Vec<String>, SliceError> {
    let mut sorted: Vec<&str> = ids.iter().map(AsRef::as_ref).collect();
    sorted.sort_unstable();

    let mut physical: Vec<String> = Vec::new();
    for id in sorted {
        let owner = slices::physical_of(id)?;
        if physical.last().map(String::as_str) != Some(owner) {
            physical.push(owner.to_string());
        }
    }
    Ok(physical)
}

/// Clamps a requested compute slice count into a percentile.
pub fn clamp_percentile(requested: usize) -> u32 {
    requested.min(MAX_COMPUTE_PERCENTILE as usize) as u32
}

fn to_owned(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use simple_test_case::test_case;

    fn pool(devices: &[(&str, u64)]) -> Vec<String> {
        devices.iter()
            .flat_map(|(uuid, n)| (0..*n).map(|i| slices::encode(uuid, i)))
            .collect()
    }

    #[test]
    fn select_preferred_must_not_mix_when_one_device_suffices() {
        let mut available = pool(&[("A", 4), ("B", 4)]);
        available.reverse();

        let selection = select_preferred(&available, 3).expect("selection");

        assert_eq!(selection.device_ids.len(), 3);
        assert_eq!(selection.locality, Locality::SinglePhysical);
        let owner = slices::physical_of(&selection.device_ids[0]).expect("id");
        assert!(selection
            .device_ids
            .iter()
            .all(|id| slices::physical_of(id) == Ok(owner)));
    }

    #[test]
    fn select_preferred_must_skip_devices_without_enough_room() {
        let available = pool(&[("A", 1), ("B", 2), ("C", 3)]);

        let selection = select_preferred(&available, 3).expect("selection");

        assert_eq!(selection.device_ids, vec!["C_0", "C_1", "C_2"]);
        assert_eq!(selection.locality, Locality::SinglePhysical);
    }

    #[test]
    fn select_preferred_must_fall_back_to_mixed_devices() {
        let available = pool(&[("A", 2), ("B", 2)]);

        let selection = select_preferred(&available, 3).expect("selection");

        assert_eq!(selection.device_ids, vec!["A_0", "A_1", "B_0"]);
        assert_eq!(selection.locality, Locality::Mixed);
    }

    #[test]
    fn select_preferred_must_reject_requests_beyond_the_pool() {
        let available = pool(&[("A", 2)]);

        assert_eq!(
            select_preferred(&available, 3),
            Err(AllocationError::InsufficientCapacity {
                requested: 3,
                available: 2
            })
        );
    }

    #[test]
    fn select_preferred_must_treat_duplicates_as_one() {
        let available = vec!["A_0", "A_0", "A_1"];

        assert!(matches!(
            select_preferred(&available, 3),
            Err(AllocationError::InsufficientCapacity { available: 2, .. })
        ));
    }

    #[test]
    fn select_preferred_must_report_malformed_ids() {
        let available = vec!["A_0", "bogus"];

        assert_eq!(
            select_preferred(&available, 1),
            Err(AllocationError::Slice(SliceError::MalformedIdentifier {
                id: "bogus".into()
            }))
        );
    }

    #[test_case(0; "nothing")]
    #[test_case(1; "one")]
    #[test_case(5; "everything on one device")]
    #[test_case(8; "the whole pool")]
    #[test]
    fn select_preferred_must_return_exactly_count(count: usize) {
        let available = pool(&[("A", 5), ("B", 3)]);
        let selection =
            select_preferred(&available, count).expect("selection");
        assert_eq!(selection.device_ids.len(), count);
    }

    #[test]
    fn realize_must_list_each_physical_device_once() {
        let ids = vec!["B_1", "A_0", "B_0", "A_3"];
        assert_eq!(realize(&ids), Ok(vec!["A".to_string(), "B".to_string()]));
    }

    #[test]
    fn realize_must_reject_malformed_ids() {
        assert!(realize(&["GPU-1_0", "GPU-2"]).is_err());
    }

    #[test_case(0, 0; "zero")]
    #[test_case(42, 42; "within bounds")]
    #[test_case(100, 100; "at the bound")]
    #[test_case(150, 100; "clamped")]
    #[test]
    fn clamp_percentile_must_cap_at_one_hundred(requested: usize, expected: u32) {
        assert_eq!(clamp_percentile(requested), expected);
    }
}
