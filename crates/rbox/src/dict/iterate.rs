//! Snapshot iteration over selected keys

use std::collections::{BTreeMap, BTreeSet, btree_map};
use std::iter::FusedIterator;

use bitflags::bitflags;
use log::debug;

use super::{RadosDictionary, Target, decode_value};
use crate::cluster::status;
use crate::error::DictError;

bitflags! {
    /// Iteration mode flags, bit-compatible with the host's dictionary API
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IterateFlags: u32 {
        const RECURSE       = 0x01;
        const SORT_BY_KEY   = 0x02;
        const SORT_BY_VALUE = 0x04;
        const NO_VALUE      = 0x08;
        const EXACT_KEY     = 0x10;
    }
}

impl IterateFlags {
    /// First requested mode that iteration does not implement
    fn unsupported(self) -> Option<&'static str> {
        [
            (Self::RECURSE, "RECURSE"),
            (Self::EXACT_KEY, "EXACT_KEY"),
            (Self::SORT_BY_KEY, "SORT_BY_KEY"),
            (Self::SORT_BY_VALUE, "SORT_BY_VALUE"),
        ]
        .into_iter()
        .find(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
    }
}

/// Forward-only cursor over an ordered snapshot of (key, value) pairs
///
/// Entries written after the snapshot was taken are not observed. Once
/// exhausted it stays exhausted.
#[derive(Debug)]
pub struct DictIterator {
    entries: btree_map::IntoIter<String, String>,
}

impl Iterator for DictIterator {
    type Item = (String, String);

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

impl ExactSizeIterator for DictIterator {}

impl FusedIterator for DictIterator {}

impl RadosDictionary {
    /// Snapshot the values of `paths` with one by-keys read per map-object
    pub fn iterate(&self, paths: &[&str], flags: IterateFlags) -> Result<DictIterator, DictError> {
        if let Some(flag) = flags.unsupported() {
            return Err(DictError::UnsupportedFlag(flag));
        }

        let mut wanted: BTreeMap<Target, BTreeSet<String>> = BTreeMap::new();
        for path in paths {
            wanted
                .entry(Target::for_key(path))
                .or_default()
                .insert(path.to_string());
        }

        let mut snapshot = BTreeMap::new();
        for (target, keys) in wanted {
            let (handle, obj) = self.map_object(target);
            let values = match handle.backend().omap_get_vals_by_keys(&obj, &keys) {
                Ok(values) => values,
                Err(status::ENOENT) => continue,
                Err(status) => {
                    return Err(DictError::Failed {
                        oid: obj.oid,
                        status,
                    });
                }
            };
            for (key, raw) in values {
                let value = if flags.contains(IterateFlags::NO_VALUE) {
                    String::new()
                } else {
                    decode_value(&raw)
                };
                snapshot.insert(key, value);
            }
        }

        debug!("iterate over {} path(s): {} entries", paths.len(), snapshot.len());
        Ok(DictIterator {
            entries: snapshot.into_iter(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemoryCluster;
    use crate::dict::tests::open_dict;

    #[test]
    fn test_flags() {
        let flags = IterateFlags::NO_VALUE | IterateFlags::RECURSE;
        assert!(flags.contains(IterateFlags::NO_VALUE));
        assert_eq!(flags.bits(), 0x09);
        assert_eq!(flags.unsupported(), Some("RECURSE"));
        assert_eq!(IterateFlags::NO_VALUE.unsupported(), None);
        assert_eq!(IterateFlags::from_bits(0x02), Some(IterateFlags::SORT_BY_KEY));
        assert_eq!(IterateFlags::from_bits_truncate(0x108), IterateFlags::NO_VALUE);
    }

    #[test]
    fn test_unsupported_flags_fail_fast() {
        let cluster = MemoryCluster::with_pools(&["librmb"]);
        let dict = open_dict(&cluster, "alice");
        let before = cluster.stats().requests;

        for flag in [
            IterateFlags::RECURSE,
            IterateFlags::EXACT_KEY,
            IterateFlags::SORT_BY_KEY,
            IterateFlags::SORT_BY_VALUE,
        ] {
            assert!(matches!(
                dict.iterate(&["priv/a"], flag),
                Err(DictError::UnsupportedFlag(_))
            ));
        }
        assert_eq!(cluster.stats().requests, before);
    }

    #[test]
    fn test_iterate_across_map_objects() {
        let cluster = MemoryCluster::with_pools(&["librmb"]);
        let dict = open_dict(&cluster, "alice");
        let mut tx = dict.transaction_begin();
        tx.set("priv/a", "1");
        tx.set("shared/z", "26");
        tx.commit().unwrap();

        let pairs: Vec<_> = dict
            .iterate(&["shared/z", "priv/a", "priv/b"], IterateFlags::empty())
            .unwrap()
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("priv/a".to_string(), "1".to_string()),
                ("shared/z".to_string(), "26".to_string()),
            ]
        );
    }

    #[test]
    fn test_no_value_flag() {
        let cluster = MemoryCluster::with_pools(&["librmb"]);
        let dict = open_dict(&cluster, "alice");
        let mut tx = dict.transaction_begin();
        tx.set("priv/a", "1");
        tx.commit().unwrap();

        let mut iter = dict.iterate(&["priv/a"], IterateFlags::NO_VALUE).unwrap();
        assert_eq!(iter.next(), Some(("priv/a".to_string(), String::new())));
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn test_snapshot_is_not_live() {
        let cluster = MemoryCluster::with_pools(&["librmb"]);
        let dict = open_dict(&cluster, "alice");
        let mut iter = dict.iterate(&["priv/a"], IterateFlags::empty()).unwrap();

        let mut tx = dict.transaction_begin();
        tx.set("priv/a", "late");
        tx.commit().unwrap();

        assert_eq!(iter.len(), 0);
        assert_eq!(iter.next(), None);
    }
}
