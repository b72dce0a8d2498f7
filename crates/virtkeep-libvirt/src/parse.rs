//! Parsers for `virsh` columnar output.
//!
//! The format-specific brittleness lives here so the rest of the stack only
//! ever sees typed records.

use std::path::PathBuf;
use virtkeep_provider::hypervisor::{BlockDeviceRecord, DomainRecord, DomainState, ImageLocator};

/// Parse `virsh list --all` output into domain records.
pub(crate) fn parse_domain_list(payload: &str) -> Vec<DomainRecord> {
    body_lines(payload)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let _id = parts.next()?;
            let name = parts.next()?;
            let state = parts.collect::<Vec<_>>().join(" ");
            if state.is_empty() {
                return None;
            }
            Some(DomainRecord {
                name: name.to_string(),
                state: parse_domain_state(&state),
            })
        })
        .collect()
}

/// Parse `virsh domblklist` output into block-device records.
pub(crate) fn parse_block_list(payload: &str) -> Vec<BlockDeviceRecord> {
    body_lines(payload)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let target = parts.next()?;
            let source = parts.collect::<Vec<_>>().join(" ");
            if source.is_empty() {
                return None;
            }
            Some(BlockDeviceRecord {
                target: target.to_string(),
                locator: parse_locator(&source),
            })
        })
        .collect()
}

/// Classify a block-device source column into a locator.
pub(crate) fn parse_locator(source: &str) -> ImageLocator {
    let trimmed = source.trim();
    if trimmed == "-" || trimmed.is_empty() {
        return ImageLocator::Empty;
    }
    if trimmed.starts_with('/') {
        return ImageLocator::Path(PathBuf::from(trimmed));
    }
    if let Some((pool, image)) = trimmed.split_once('/') {
        if !pool.is_empty() && !image.is_empty() {
            return ImageLocator::Rbd {
                pool: pool.to_string(),
                image: image.to_string(),
            };
        }
    }
    ImageLocator::Path(PathBuf::from(trimmed))
}

fn parse_domain_state(state: &str) -> DomainState {
    // only an actively running guest needs the live-snapshot protocol; every
    // other state reads as a quiescent disk
    if state.eq_ignore_ascii_case("running") {
        DomainState::Running
    } else {
        DomainState::Stopped
    }
}

/// Rows after the dashed header separator `virsh` prints.
fn body_lines(payload: &str) -> impl Iterator<Item = &str> {
    payload
        .lines()
        .skip_while(|line| {
            let trimmed = line.trim();
            trimmed.is_empty() || !trimmed.chars().all(|ch| ch == '-')
        })
        .skip(1)
        .map(str::trim)
        .filter(|line| !line.is_empty())
}
