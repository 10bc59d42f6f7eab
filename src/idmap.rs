//! Parsing of the uid/gid mapping label values.
//!
//! The wire form is one or more `container:host:size` triples separated by
//! commas, e.g. `"0:1000:65536"`. The snapshotter only needs the host pair
//! that container root maps to, so it can chown fresh upperdirs.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapping {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Default)]
pub struct IdMap {
    pub uids: Vec<IdMapping>,
    pub gids: Vec<IdMapping>,
}

fn parse_mappings(value: &str) -> Result<Vec<IdMapping>> {
    let mut mappings = Vec::new();
    for triple in value.split(',') {
        let mut fields = triple.splitn(3, ':');
        let (c, h, s) = match (fields.next(), fields.next(), fields.next()) {
            (Some(c), Some(h), Some(s)) => (c, h, s),
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "malformed id mapping triple {triple:?}"
                )))
            }
        };
        let parse = |v: &str| {
            v.trim().parse::<u32>().map_err(|_| {
                Error::InvalidArgument(format!("malformed id mapping triple {triple:?}"))
            })
        };
        mappings.push(IdMapping {
            container_id: parse(c)?,
            host_id: parse(h)?,
            size: parse(s)?,
        });
    }
    Ok(mappings)
}

fn root_of(mappings: &[IdMapping]) -> Option<u32> {
    mappings
        .iter()
        .find(|m| m.container_id == 0 && m.size > 0)
        .map(|m| m.host_id)
}

impl IdMap {
    /// Parses the uid and gid label values in tandem.
    pub fn parse(uid_label: &str, gid_label: &str) -> Result<Self> {
        Ok(Self {
            uids: parse_mappings(uid_label)?,
            gids: parse_mappings(gid_label)?,
        })
    }

    /// Returns the host `(uid, gid)` that container root maps to.
    pub fn root_pair(&self) -> Result<(u32, u32)> {
        match (root_of(&self.uids), root_of(&self.gids)) {
            (Some(uid), Some(gid)) => Ok((uid, gid)),
            _ => Err(Error::InvalidArgument(
                "id mappings do not cover container root".to_string(),
            )),
        }
    }
}
