//! Validation of the host's subordinate id configuration.
//!
//! The monitor runs unprivileged; the wrapper maps container ids into the
//! contiguous subuid/subgid block granted to the monitor's user. Container
//! ids are offset identically into the block, so a block of
//! [`MIN_SUBIDS`] ids covers everything up to the designated root id.

use anyhow::{bail, Context as _, Result};
use squall_base::{User, MIN_SUBIDS};
use std::fs;

/// One `user:start:length` grant from `/etc/subuid` or `/etc/subgid`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SubIdRange {
    pub start: u32,
    pub length: u32,
}

/// Find the grant for `user` (matched by name or numeric id) in the contents
/// of a subid file. The first matching line wins; lines with non-integer
/// fields are skipped, not fatal.
pub fn find_subid_range(content: &str, user: &str, uid: u32) -> Option<SubIdRange> {
    let uid_string = uid.to_string();
    for line in content.lines() {
        let mut fields = line.split(':');
        let (Some(name), Some(start), Some(length)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if name != user && name != uid_string {
            continue;
        }
        let (Ok(start), Ok(length)) = (start.trim().parse(), length.trim().parse()) else {
            continue;
        };
        return Some(SubIdRange { start, length });
    }
    None
}

/// The first id mapped into containers, from the given subuid and subgid file
/// contents. Fails unless both files grant at least [`MIN_SUBIDS`]
/// consecutive ids.
pub fn first_user_mapped(subuid: &str, subgid: &str, user: &str, uid: u32) -> Result<User> {
    let uid_range = find_subid_range(subuid, user, uid)
        .with_context(|| format!("no subuid range configured for {user}"))?;
    let gid_range = find_subid_range(subgid, user, uid)
        .with_context(|| format!("no subgid range configured for {user}"))?;
    if uid_range.length < MIN_SUBIDS || gid_range.length < MIN_SUBIDS {
        bail!("not enough subuid or subgid configured ({MIN_SUBIDS} needed)");
    }
    Ok(User {
        uid: uid_range.start,
        gid: gid_range.start,
    })
}

/// Read `/etc/subuid` and `/etc/subgid` and resolve the mapped block for the
/// current user.
pub fn discover(current_user: User) -> Result<User> {
    let name = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(current_user.uid))
        .context("looking up current user")?
        .map(|entry| entry.name)
        .unwrap_or_else(|| current_user.uid.to_string());
    let subuid = fs::read_to_string("/etc/subuid").context("reading /etc/subuid")?;
    let subgid = fs::read_to_string("/etc/subgid").context("reading /etc/subgid")?;
    first_user_mapped(&subuid, &subgid, &name, current_user.uid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_matching_line_wins() {
        let content = "alice:100000:65536\nbob:200000:65536\nalice:300000:65536\n";
        assert_eq!(
            find_subid_range(content, "alice", 1000),
            Some(SubIdRange {
                start: 100000,
                length: 65536
            })
        );
    }

    #[test]
    fn numeric_uid_matches() {
        let content = "1000:100000:65536\n";
        assert_eq!(
            find_subid_range(content, "alice", 1000),
            Some(SubIdRange {
                start: 100000,
                length: 65536
            })
        );
    }

    #[test]
    fn non_integer_fields_are_skipped_not_fatal() {
        let content = "alice:not-a-number:65536\nalice:100000:65536\n";
        assert_eq!(
            find_subid_range(content, "alice", 1000),
            Some(SubIdRange {
                start: 100000,
                length: 65536
            })
        );
    }

    #[test]
    fn short_lines_are_skipped() {
        let content = "alice\nalice:100000\nbob:1:2\n";
        assert_eq!(find_subid_range(content, "alice", 1000), None);
    }

    #[test]
    fn insufficient_block_is_rejected() {
        let err = first_user_mapped("user:100000:500\n", "user:100000:65536\n", "user", 1000)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "not enough subuid or subgid configured (1001 needed)"
        );
    }

    #[test]
    fn exactly_1001_ids_is_enough() {
        let mapped =
            first_user_mapped("user:100000:1001\n", "user:200000:1001\n", "user", 1000).unwrap();
        assert_eq!(
            mapped,
            User {
                uid: 100000,
                gid: 200000
            }
        );
    }

    #[test]
    fn missing_user_is_an_error() {
        assert!(first_user_mapped("bob:1:100000\n", "bob:1:100000\n", "alice", 1000).is_err());
    }
}
