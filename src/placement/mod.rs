//! Replica placement: which two nodes hold a new row.
//!
//! Selection is per-row and uniformly random with no sticky affinity, so
//! data spreads across the cluster without coordination.  The policy
//! degrades gracefully: a lone node owns everything with no secondary,
//! and a two-node cluster always uses both.


use rand::seq::SliceRandom;
use rand::Rng;

use crate::cluster::NodeRecord;
use crate::table::Placement;

/// Uniform random primary/secondary selection.
#[derive(Debug, Default)]
pub struct PlacementPolicy;

impl PlacementPolicy {
    /// Picks `(primary, secondary)` for a new row.
    ///
    /// - No peers: `(self, empty sentinel)`.
    /// - One peer: `(self, peer)` when `prefer_self_primary` (the caller
    ///   already holds the row locally), otherwise either order.
    /// - More peers: two distinct nodes uniformly at random from the
    ///   roster including self; `prefer_self_primary` pins self as
    ///   primary and draws only the secondary.
    pub fn choose(
        &self,
        self_id: &str,
        peers: &[NodeRecord],
        prefer_self_primary: bool,
    ) -> Placement {
        let mut rng = rand::thread_rng();
        match peers {
            [] => Placement::solo(self_id),
            [only] => {
                if prefer_self_primary || rng.gen_bool(0.5) {
                    Placement::new(self_id, only.id.clone())
                } else {
                    Placement::new(only.id.clone(), self_id)
                }
            }
            _ => {
                if prefer_self_primary {
                    let secondary = peers
                        .choose(&mut rng)
                        .map(|p| p.id.clone())
                        .unwrap_or_default();
                    return Placement::new(self_id, secondary);
                }
                let mut candidates: Vec<&str> =
                    peers.iter().map(|p| p.id.as_str()).collect();
                candidates.push(self_id);
                let picked: Vec<&&str> = candidates.choose_multiple(&mut rng, 2).collect();
                Placement::new(*picked[0], *picked[1])
            }
        }
    }
}
