//! Peer resolution and classification

use std::net::IpAddr;

use crate::config::MemberConfig;
use crate::consensus::Peer;

use super::ClusterError;

/// Resolve every configured member to a socket address
pub async fn resolve_members(members: &[MemberConfig]) -> Result<Vec<Peer>, ClusterError> {
    let mut peers = Vec::with_capacity(members.len());
    for member in members {
        let address = tokio::net::lookup_host(member.address.as_str())
            .await
            .map_err(|e| ClusterError::Address {
                address: member.address.clone(),
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| ClusterError::Address {
                address: member.address.clone(),
                reason: "no addresses resolved".to_string(),
            })?;
        peers.push(Peer::new(member.id.clone(), address));
    }
    Ok(peers)
}

/// Split members into the local peer and the remote peers.
///
/// With `node_id` the local peer is the member with that id. Otherwise it is
/// the single member whose IP is assigned to this host; zero or several such
/// members is an error.
pub fn classify_peers<F>(
    members: &[Peer],
    node_id: Option<&str>,
    is_local: F,
) -> Result<(Peer, Vec<Peer>), ClusterError>
where
    F: Fn(IpAddr) -> bool,
{
    let local = match node_id {
        Some(id) => members
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or_else(|| {
                ClusterError::Classification(format!("node_id '{}' is not a configured member", id))
            })?,
        None => {
            let matches: Vec<&Peer> = members.iter().filter(|m| is_local(m.address.ip())).collect();
            match matches.as_slice() {
                [local] => (*local).clone(),
                [] => {
                    return Err(ClusterError::Classification(
                        "no configured member address is assigned to this host".to_string(),
                    ))
                }
                several => {
                    let ids: Vec<&str> = several.iter().map(|m| m.id.as_str()).collect();
                    return Err(ClusterError::Classification(format!(
                        "members {} all match this host; set node_id to choose one",
                        ids.join(", ")
                    )));
                }
            }
        }
    };

    let remotes = members.iter().filter(|m| **m != local).cloned().collect();
    Ok((local, remotes))
}
