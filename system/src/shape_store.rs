use std::collections::{HashMap, HashSet, VecDeque};

use crate::config::EngineConfig;
use crate::error::{MutationError, SessionError};
use crate::geometry::{HasBounds, Viewport};
use crate::mutation::{AcceptedUpdate, ShapeOp, ShapeOpKind};
use crate::shape::Shape;
use crate::types::{ServerSeq, ShapeId, Timestamp};
use crate::viewport_culler::ViewportCuller;
use serde::{Deserialize, Serialize};

/// Live shapes of a session at exactly one `server_seq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub shapes: Vec<Shape>,
    pub server_seq: ServerSeq,
}

/// What accepting a mutation would do, decided without touching the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Prepared {
    /// The mutation changes the shape; `shape` is the state to commit.
    Accept { op: ShapeOpKind, shape: Shape },
    /// Deleting something that is not there.
    NoOp,
    /// An upsert raced with a delete it never saw. Carries the tombstone.
    Stale(Shape),
}

/// Canonical shape set of a session.
///
/// Deleted shapes stay as tombstones until either `tombstone_limit` newer
/// tombstones push them out or `tombstone_ttl_ms` passes.
#[derive(Debug, Clone)]
pub struct ShapeStore {
    shapes: HashMap<ShapeId, Shape>,
    tombstones: VecDeque<(ShapeId, Timestamp)>,
    culler: ViewportCuller,
    server_seq: ServerSeq,
    tombstone_limit: usize,
    tombstone_ttl_ms: i64,
}

impl ShapeStore {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            shapes: HashMap::new(),
            tombstones: VecDeque::new(),
            culler: ViewportCuller::new(config.grid_cell_size, config.viewport_margin),
            server_seq: 0,
            tombstone_limit: config.tombstone_limit,
            tombstone_ttl_ms: config.tombstone_ttl_ms as i64,
        }
    }

    pub fn from_snapshot(snapshot: &StoreSnapshot, config: &EngineConfig) -> Self {
        let mut store = Self::new(config);
        for shape in &snapshot.shapes {
            store.insert_live(shape.clone());
        }
        store.server_seq = snapshot.server_seq;
        store
    }

    pub fn server_seq(&self) -> ServerSeq {
        self.server_seq
    }

    /// Includes tombstones.
    pub fn get(&self, id: &str) -> Option<&Shape> {
        self.shapes.get(id)
    }

    pub fn live_count(&self) -> usize {
        self.shapes.len() - self.tombstones.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let mut shapes = self
            .shapes
            .values()
            .filter(|shape| !shape.deleted)
            .cloned()
            .collect::<Vec<_>>();
        shapes.sort_by(|a, b| a.id.cmp(&b.id));
        StoreSnapshot {
            shapes,
            server_seq: self.server_seq,
        }
    }

    pub fn get_visible(&self, viewport: &Viewport) -> Vec<&Shape> {
        self.culler
            .query(&viewport.rect())
            .iter()
            .filter_map(|id| self.shapes.get(id))
            .collect()
    }

    /// Splits the live shapes into those near `viewport` and everything
    /// else, both sorted by id.
    pub fn partition_by_viewport(&self, viewport: &Viewport) -> (Vec<Shape>, Vec<Shape>) {
        let visible = self.get_visible(viewport);
        let visible_ids = visible
            .iter()
            .map(|shape| shape.id.as_str())
            .collect::<HashSet<_>>();
        let mut rest = self
            .shapes
            .values()
            .filter(|shape| !shape.deleted && !visible_ids.contains(shape.id.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        rest.sort_by(|a, b| a.id.cmp(&b.id));
        (visible.into_iter().cloned().collect(), rest)
    }

    /// Resolves `op` against the current state with last-write-wins: the
    /// resulting version is always one past the stored one, whatever
    /// version the client based its edit on.
    ///
    /// A shape the store does not know starts at the `server_seq` that
    /// creates it. Every version ever handed out is at most the seq that
    /// produced it, so an id re-created after its tombstone was evicted
    /// still moves forward on replicas that kept the tombstone.
    pub fn prepare(&self, op: &ShapeOp, now: Timestamp) -> Result<Prepared, MutationError> {
        op.validate()?;

        match op {
            ShapeOp::Upsert(draft) => {
                let version = match self.shapes.get(&draft.id) {
                    Some(current) if current.deleted => {
                        if draft.base_version != Some(current.version) {
                            return Ok(Prepared::Stale(current.clone()));
                        }
                        current.version + 1
                    }
                    Some(current) => current.version + 1,
                    // Edited from a shape whose tombstone is already gone.
                    None => match draft.base_version {
                        Some(base) => {
                            return Ok(Prepared::Stale(Shape {
                                id: draft.id.clone(),
                                kind: draft.kind.clone(),
                                version: base + 1,
                                updated_at: now,
                                deleted: true,
                            }))
                        }
                        None => self.server_seq + 1,
                    },
                };
                Ok(Prepared::Accept {
                    op: ShapeOpKind::Upsert,
                    shape: Shape {
                        id: draft.id.clone(),
                        kind: draft.kind.clone(),
                        version,
                        updated_at: now,
                        deleted: false,
                    },
                })
            }
            ShapeOp::Delete { id, .. } => match self.shapes.get(id) {
                Some(current) if !current.deleted => Ok(Prepared::Accept {
                    op: ShapeOpKind::Delete,
                    shape: Shape {
                        version: current.version + 1,
                        updated_at: now,
                        deleted: true,
                        ..current.clone()
                    },
                }),
                _ => Ok(Prepared::NoOp),
            },
        }
    }

    /// The only way canonical state changes. Returns the ids of the shapes
    /// the update touched.
    pub fn apply_accepted(
        &mut self,
        update: &AcceptedUpdate,
    ) -> Result<Vec<ShapeId>, SessionError> {
        let expected = self.server_seq + 1;
        if update.server_seq != expected {
            return Err(SessionError::SeqRegression {
                expected,
                actual: update.server_seq,
            });
        }

        let shape = &update.shape;
        let was_deleted = match self.shapes.get(&shape.id) {
            Some(current) if current.version >= shape.version => {
                return Err(SessionError::VersionRegression {
                    shape_id: shape.id.clone(),
                    current: current.version,
                    proposed: shape.version,
                })
            }
            Some(current) => current.deleted,
            None => false,
        };

        if shape.deleted {
            self.culler.remove(&shape.id);
            if !was_deleted {
                self.tombstones
                    .push_back((shape.id.clone(), shape.updated_at));
            }
            self.shapes.insert(shape.id.clone(), shape.clone());
        } else {
            if was_deleted {
                self.tombstones.retain(|(id, _)| id != &shape.id);
            }
            self.insert_live(shape.clone());
        }
        self.server_seq = update.server_seq;

        while self.tombstones.len() > self.tombstone_limit {
            self.pop_tombstone();
        }

        Ok(vec![shape.id.clone()])
    }

    /// Drops tombstones older than the ttl. Returns how many went away.
    pub fn purge_tombstones(&mut self, now: Timestamp) -> usize {
        let mut purged = 0;
        while let Some((_, deleted_at)) = self.tombstones.front() {
            if now - deleted_at <= self.tombstone_ttl_ms {
                break;
            }
            self.pop_tombstone();
            purged += 1;
        }
        purged
    }

    fn pop_tombstone(&mut self) {
        if let Some((id, _)) = self.tombstones.pop_front() {
            log::debug!("tombstone of {} expired", id);
            self.shapes.remove(&id);
        }
    }

    fn insert_live(&mut self, shape: Shape) {
        self.culler.update(shape.id.clone(), shape.bounds());
        self.shapes.insert(shape.id.clone(), shape);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Point;
    use crate::shape::{ShapeDraft, ShapeKind};

    fn rectangle(id: &str, x: f32, y: f32) -> ShapeOp {
        ShapeOp::Upsert(ShapeDraft {
            id: id.into(),
            kind: ShapeKind::Rectangle {
                x,
                y,
                width: 10.0,
                height: 10.0,
                fill: None,
                corner_radius: 0.0,
            },
            base_version: None,
        })
    }

    fn delete(id: &str) -> ShapeOp {
        ShapeOp::Delete {
            id: id.into(),
            base_version: None,
        }
    }

    fn commit(store: &mut ShapeStore, op: &ShapeOp, now: Timestamp) -> Option<AcceptedUpdate> {
        match store.prepare(op, now).expect("valid op") {
            Prepared::Accept { op, shape } => {
                let update = AcceptedUpdate {
                    server_seq: store.server_seq() + 1,
                    sender_id: 1,
                    message_id: format!("m{}", store.server_seq() + 1),
                    client_seq: None,
                    op,
                    shape,
                };
                store.apply_accepted(&update).expect("must apply");
                Some(update)
            }
            _ => None,
        }
    }

    fn store() -> ShapeStore {
        ShapeStore::new(&EngineConfig::default())
    }

    #[test]
    fn it_bumps_version_by_exactly_one_per_upsert() {
        let mut store = store();
        commit(&mut store, &rectangle("s1", 0.0, 0.0), 1);
        assert_eq!(store.snapshot().shapes[0].version, 1);

        commit(&mut store, &rectangle("s1", 5.0, 0.0), 2);
        let snapshot = store.snapshot();
        assert_eq!(snapshot.shapes[0].version, 2);
        assert_eq!(snapshot.server_seq, 2);
    }

    #[test]
    fn it_overwrites_with_a_higher_version_even_when_the_client_was_stale() {
        let mut store = store();
        commit(&mut store, &rectangle("s1", 0.0, 0.0), 1);
        commit(&mut store, &rectangle("s1", 1.0, 0.0), 2);

        let stale = ShapeOp::Upsert(ShapeDraft {
            base_version: Some(1),
            ..match rectangle("s1", 9.0, 9.0) {
                ShapeOp::Upsert(draft) => draft,
                _ => unreachable!(),
            }
        });
        let update = commit(&mut store, &stale, 3).expect("accepted");
        assert_eq!(update.shape.version, 3);
        assert_eq!(store.get("s1").map(|s| s.bounds().min.x), Some(9.0));
    }

    #[test]
    fn it_keeps_tombstones_and_hides_them_from_snapshots() {
        let mut store = store();
        commit(&mut store, &rectangle("s1", 0.0, 0.0), 1);
        let update = commit(&mut store, &delete("s1"), 2).expect("accepted");

        assert!(update.shape.deleted);
        assert_eq!(update.shape.version, 2);
        assert!(store.snapshot().shapes.is_empty());
        assert_eq!(store.tombstone_count(), 1);
        assert!(store.get_visible(&Viewport::new(0.0, 0.0, 100.0, 100.0)).is_empty());
    }

    #[test]
    fn it_treats_deleting_unknown_or_deleted_shapes_as_noop() {
        let mut store = store();
        assert_eq!(store.prepare(&delete("ghost"), 1), Ok(Prepared::NoOp));

        commit(&mut store, &rectangle("s1", 0.0, 0.0), 1);
        commit(&mut store, &delete("s1"), 2);
        assert_eq!(store.prepare(&delete("s1"), 3), Ok(Prepared::NoOp));
        assert_eq!(store.server_seq(), 2);
    }

    #[test]
    fn it_refuses_to_resurrect_a_shape_from_a_late_upsert() {
        let mut store = store();
        commit(&mut store, &rectangle("s1", 0.0, 0.0), 1);
        commit(&mut store, &delete("s1"), 2);

        match store.prepare(&rectangle("s1", 3.0, 3.0), 3) {
            Ok(Prepared::Stale(tombstone)) => {
                assert!(tombstone.deleted);
                assert_eq!(tombstone.version, 2);
            }
            other => panic!("unexpected {:?}", other),
        }

        // A client that saw the delete may re-create the id.
        let recreate = ShapeOp::Upsert(ShapeDraft {
            id: "s1".into(),
            kind: ShapeKind::Path {
                points: vec![Point::new(0.0, 0.0)],
                stroke: None,
                stroke_width: 1.0,
                closed: false,
            },
            base_version: Some(2),
        });
        let update = commit(&mut store, &recreate, 4).expect("accepted");
        assert_eq!(update.shape.version, 3);
        assert_eq!(store.tombstone_count(), 0);
        assert_eq!(store.live_count(), 1);
    }

    #[test]
    fn it_rejects_out_of_order_and_regressing_updates() {
        let mut store = store();
        let first = commit(&mut store, &rectangle("s1", 0.0, 0.0), 1).expect("accepted");

        assert!(matches!(
            store.apply_accepted(&first),
            Err(SessionError::SeqRegression {
                expected: 2,
                actual: 1
            })
        ));

        let regressed = AcceptedUpdate {
            server_seq: 2,
            ..first
        };
        assert!(matches!(
            store.apply_accepted(&regressed),
            Err(SessionError::VersionRegression { .. })
        ));
    }

    #[test]
    fn it_bounds_tombstones_by_count_and_age() {
        let config = EngineConfig {
            tombstone_limit: 2,
            tombstone_ttl_ms: 1_000,
            ..EngineConfig::default()
        };
        let mut store = ShapeStore::new(&config);
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            commit(&mut store, &rectangle(id, 0.0, 0.0), i as i64);
        }
        commit(&mut store, &delete("a"), 10);
        commit(&mut store, &delete("b"), 20);
        commit(&mut store, &delete("c"), 500);

        assert_eq!(store.tombstone_count(), 2);
        assert!(store.get("a").is_none());

        assert_eq!(store.purge_tombstones(1_100), 1);
        assert!(store.get("b").is_none());
        assert!(store.get("c").is_some());
    }

    #[test]
    fn it_keeps_versions_moving_forward_after_a_tombstone_is_evicted() {
        let config = EngineConfig {
            tombstone_limit: 1,
            ..EngineConfig::default()
        };
        let mut store = ShapeStore::new(&config);
        // The replica still holds every tombstone.
        let mut replica = ShapeStore::new(&EngineConfig::default());
        let mut commit_both = |store: &mut ShapeStore, op: &ShapeOp, now: Timestamp| {
            let update = commit(store, op, now).expect("accepted");
            replica.apply_accepted(&update).expect("replica applies");
            update
        };
        commit_both(&mut store, &rectangle("s1", 0.0, 0.0), 1);
        commit_both(&mut store, &rectangle("s1", 1.0, 0.0), 2);
        let deleted = commit_both(&mut store, &delete("s1"), 3);
        commit_both(&mut store, &rectangle("x", 0.0, 0.0), 4);
        commit_both(&mut store, &delete("x"), 5);
        assert!(store.get("s1").is_none());

        // An edit based on the deleted shape must not bring it back.
        let late = ShapeOp::Upsert(ShapeDraft {
            base_version: Some(2),
            ..match rectangle("s1", 9.0, 9.0) {
                ShapeOp::Upsert(draft) => draft,
                _ => unreachable!(),
            }
        });
        match store.prepare(&late, 6) {
            Ok(Prepared::Stale(tombstone)) => {
                assert!(tombstone.deleted);
                assert_eq!(tombstone.version, 3);
            }
            other => panic!("unexpected {:?}", other),
        }

        let recreated = commit(&mut store, &rectangle("s1", 2.0, 2.0), 7).expect("accepted");
        assert!(recreated.shape.version > deleted.shape.version);
        assert_eq!(replica.get("s1").map(|s| s.deleted), Some(true));
        replica.apply_accepted(&recreated).expect("replica applies");
        assert_eq!(replica.get("s1").map(|s| s.deleted), Some(false));
        assert_eq!(replica.snapshot(), store.snapshot());
    }

    #[test]
    fn it_rejects_malformed_ops_without_side_effects() {
        let store = store();
        assert_eq!(
            store.prepare(&delete(""), 1),
            Err(MutationError::EmptyShapeId)
        );
        assert_eq!(store.server_seq(), 0);
    }

    #[test]
    fn it_rebuilds_a_replica_from_a_snapshot() {
        let mut store = store();
        commit(&mut store, &rectangle("s1", 0.0, 0.0), 1);
        commit(&mut store, &rectangle("s2", 500.0, 500.0), 2);

        let replica = ShapeStore::from_snapshot(&store.snapshot(), &EngineConfig::default());
        assert_eq!(replica.snapshot(), store.snapshot());
        let (visible, rest) = replica.partition_by_viewport(&Viewport::new(0.0, 0.0, 50.0, 50.0));
        assert_eq!(visible.len(), 1);
        assert_eq!(rest[0].id, "s2");
    }
}
