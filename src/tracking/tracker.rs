use std::collections::{BTreeMap, HashSet};

use crate::analytics::{BBox, Detection, Point};
use crate::config::TrackingConfig;

use super::History;

pub const HISTORY_LEN: usize = 30;

#[derive(Debug, Clone)]
pub struct Track {
    pub id: u64,
    pub class_id: u32,
    pub centroid: Point,
    pub bbox: BBox,
    pub confidence: f32,
    /// Update cycles since the last match.
    pub age: u32,
    pub hits: u32,
    pub history: History<Point>,
}

impl Track {
    fn new(id: u64, detection: &Detection) -> Self {
        let centroid = detection.centroid();
        let mut history = History::with_capacity(HISTORY_LEN);
        history.push(centroid);
        Self {
            id,
            class_id: detection.class_id,
            centroid,
            bbox: detection.bbox,
            confidence: detection.confidence,
            age: 0,
            hits: 1,
            history,
        }
    }

    fn observe(&mut self, detection: &Detection) {
        self.centroid = detection.centroid();
        self.bbox = detection.bbox;
        self.confidence = detection.confidence;
        self.age = 0;
        self.hits += 1;
        self.history.push(self.centroid);
    }
}

#[derive(Debug, Clone)]
pub struct Assignment {
    pub track_id: u64,
    pub detection: Detection,
    /// Set only on the cycle where the track's hits first reach `min_hits`.
    pub newly_confirmed: bool,
}

// Detections are associated in input order; a track claimed earlier in the
// same frame is not offered to later ones. Ids are never reused.
#[derive(Debug)]
pub struct CentroidTracker {
    tracks: BTreeMap<u64, Track>,
    next_id: u64,
    max_distance: f32,
    min_confidence: f32,
    max_age: u32,
    min_hits: u32,
    frame_count: u64,
}

impl CentroidTracker {
    pub fn new(config: &TrackingConfig) -> Self {
        Self {
            tracks: BTreeMap::new(),
            next_id: 0,
            max_distance: config.max_distance,
            min_confidence: config.min_confidence,
            max_age: config.max_age,
            min_hits: config.min_hits,
            frame_count: 0,
        }
    }

    pub fn update(&mut self, detections: &[Detection]) -> Vec<Assignment> {
        self.frame_count += 1;
        self.age_tracks();

        let mut claimed = HashSet::new();
        let mut assignments = Vec::with_capacity(detections.len());

        for detection in detections
            .iter()
            .filter(|d| d.confidence >= self.min_confidence)
        {
            let centroid = detection.centroid();

            let track_id = match self.nearest_track(centroid, &claimed) {
                Some(id) => {
                    if let Some(track) = self.tracks.get_mut(&id) {
                        track.observe(detection);
                    }
                    id
                }
                None => self.spawn_track(detection),
            };
            claimed.insert(track_id);

            let newly_confirmed = self
                .tracks
                .get(&track_id)
                .is_some_and(|t| t.hits == self.min_hits);

            if newly_confirmed {
                tracing::trace!(track = track_id, frame = self.frame_count, "track confirmed");
            }

            assignments.push(Assignment {
                track_id,
                detection: detection.clone(),
                newly_confirmed,
            });
        }

        assignments
    }

    fn age_tracks(&mut self) {
        let max_age = self.max_age;
        self.tracks.retain(|id, track| {
            track.age += 1;
            let keep = track.age <= max_age;
            if !keep {
                tracing::trace!(track = *id, age = track.age, "track evicted");
            }
            keep
        });
    }

    fn nearest_track(&self, centroid: Point, claimed: &HashSet<u64>) -> Option<u64> {
        let mut best: Option<(u64, f32)> = None;
        for (id, track) in &self.tracks {
            if claimed.contains(id) {
                continue;
            }
            let dist = centroid.distance(&track.centroid);
            if dist >= self.max_distance {
                continue;
            }
            match best {
                Some((_, best_dist)) if dist >= best_dist => {}
                _ => best = Some((*id, dist)),
            }
        }
        best.map(|(id, _)| id)
    }

    fn spawn_track(&mut self, detection: &Detection) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.tracks.insert(id, Track::new(id, detection));
        id
    }

    pub fn track(&self, id: u64) -> Option<&Track> {
        self.tracks.get(&id)
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_confirmed(&self, track: &Track) -> bool {
        track.hits >= self.min_hits
    }

    pub fn confirmed_count(&self) -> usize {
        self.tracks.values().filter(|t| self.is_confirmed(t)).count()
    }
}
