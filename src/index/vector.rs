use std::collections::{BinaryHeap, HashMap, HashSet};

use parking_lot::Mutex;
use rand::Rng;

use crate::schema::VectorDistance;

/// Candidate ordered by distance; the heap direction is chosen by the wrapper.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Scored {
    dist: f32,
    label: u32,
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then(self.label.cmp(&other.label))
    }
}

fn distance(a: &[f32], b: &[f32], metric: VectorDistance) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    match metric {
        VectorDistance::Ip => 1.0 - dot,
        VectorDistance::Cosine => {
            let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm_a == 0.0 || norm_b == 0.0 {
                return 1.0;
            }
            1.0 - dot / (norm_a * norm_b)
        }
    }
}

/// One HNSW graph. Labels are dense indexes into the parallel vectors; deletes
/// tombstone a label until the next rebuild compacts the graph.
struct Graph {
    m: usize,
    ef_construction: usize,
    metric: VectorDistance,
    vectors: Vec<Vec<f32>>,
    levels: Vec<usize>,
    links: Vec<Vec<Vec<u32>>>,
    seq_of: Vec<u32>,
    label_of: HashMap<u32, u32>,
    deleted: HashSet<u32>,
    entry: Option<u32>,
    max_level: usize,
    level_mult: f64,
}

impl Graph {
    fn new(m: usize, ef_construction: usize, metric: VectorDistance) -> Self {
        Self {
            m,
            ef_construction,
            metric,
            vectors: Vec::new(),
            levels: Vec::new(),
            links: Vec::new(),
            seq_of: Vec::new(),
            label_of: HashMap::new(),
            deleted: HashSet::new(),
            entry: None,
            max_level: 0,
            level_mult: 1.0 / (m.max(2) as f64).ln(),
        }
    }

    fn live_len(&self) -> usize {
        self.label_of.len()
    }

    fn draw_level(&self) -> usize {
        let uniform: f64 = rand::thread_rng().gen_range(f64::EPSILON..1.0);
        ((-uniform.ln()) * self.level_mult) as usize
    }

    fn max_links(&self, level: usize) -> usize {
        if level == 0 {
            self.m * 2
        } else {
            self.m
        }
    }

    fn insert(&mut self, seq_id: u32, vector: Vec<f32>) {
        if let Some(old) = self.label_of.remove(&seq_id) {
            self.deleted.insert(old);
        }

        let label = self.vectors.len() as u32;
        let level = self.draw_level();
        self.vectors.push(vector);
        self.levels.push(level);
        self.links.push(vec![Vec::new(); level + 1]);
        self.seq_of.push(seq_id);
        self.label_of.insert(seq_id, label);

        let Some(mut ep) = self.entry else {
            self.entry = Some(label);
            self.max_level = level;
            return;
        };

        let query = self.vectors[label as usize].clone();

        // Greedy descent through the levels above the new node's level.
        let mut lc = self.max_level;
        while lc > level {
            ep = self.greedy_closest(&query, ep, lc);
            lc -= 1;
        }

        // Connect at each level from min(level, max_level) down to 0.
        let mut lc = level.min(self.max_level);
        loop {
            let candidates = self.search_layer(&query, ep, self.ef_construction, lc, true);
            let selected: Vec<u32> = candidates
                .iter()
                .take(self.max_links(lc))
                .map(|s| s.label)
                .collect();

            for &neighbor in &selected {
                self.links[label as usize][lc].push(neighbor);
                self.links[neighbor as usize][lc].push(label);
                self.prune(neighbor, lc);
            }
            if let Some(best) = candidates.first() {
                ep = best.label;
            }
            if lc == 0 {
                break;
            }
            lc -= 1;
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry = Some(label);
        }
    }

    fn prune(&mut self, label: u32, level: usize) {
        let cap = self.max_links(level);
        if self.links[label as usize][level].len() <= cap {
            return;
        }
        let base = self.vectors[label as usize].clone();
        let mut scored: Vec<Scored> = self.links[label as usize][level]
            .iter()
            .map(|&n| Scored {
                dist: distance(&base, &self.vectors[n as usize], self.metric),
                label: n,
            })
            .collect();
        scored.sort();
        scored.truncate(cap);
        self.links[label as usize][level] = scored.into_iter().map(|s| s.label).collect();
    }

    fn greedy_closest(&self, query: &[f32], mut ep: u32, level: usize) -> u32 {
        let mut best = distance(query, &self.vectors[ep as usize], self.metric);
        loop {
            let mut improved = false;
            for &neighbor in &self.links[ep as usize][level] {
                let d = distance(query, &self.vectors[neighbor as usize], self.metric);
                if d < best {
                    best = d;
                    ep = neighbor;
                    improved = true;
                }
            }
            if !improved {
                return ep;
            }
        }
    }

    /// Beam search at one level. `include_deleted` keeps tombstoned labels as
    /// routing waypoints during construction.
    fn search_layer(
        &self,
        query: &[f32],
        ep: u32,
        ef: usize,
        level: usize,
        include_deleted: bool,
    ) -> Vec<Scored> {
        let mut visited: HashSet<u32> = HashSet::new();
        visited.insert(ep);

        let ep_dist = distance(query, &self.vectors[ep as usize], self.metric);
        // Min-heap of candidates via Reverse; max-heap of results.
        let mut candidates: BinaryHeap<std::cmp::Reverse<Scored>> = BinaryHeap::new();
        let mut results: BinaryHeap<Scored> = BinaryHeap::new();
        candidates.push(std::cmp::Reverse(Scored {
            dist: ep_dist,
            label: ep,
        }));
        results.push(Scored {
            dist: ep_dist,
            label: ep,
        });

        while let Some(std::cmp::Reverse(current)) = candidates.pop() {
            let worst = results.peek().map(|s| s.dist).unwrap_or(f32::MAX);
            if current.dist > worst && results.len() >= ef {
                break;
            }
            for &neighbor in &self.links[current.label as usize][level.min(self.levels[current.label as usize])] {
                if !visited.insert(neighbor) {
                    continue;
                }
                let d = distance(query, &self.vectors[neighbor as usize], self.metric);
                let worst = results.peek().map(|s| s.dist).unwrap_or(f32::MAX);
                if results.len() < ef || d < worst {
                    candidates.push(std::cmp::Reverse(Scored {
                        dist: d,
                        label: neighbor,
                    }));
                    results.push(Scored {
                        dist: d,
                        label: neighbor,
                    });
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out: Vec<Scored> = results.into_vec();
        if !include_deleted {
            out.retain(|s| !self.deleted.contains(&s.label));
        }
        out.sort();
        out
    }

    fn knn(&self, query: &[f32], k: usize, ef: usize) -> Vec<(u32, f32)> {
        let Some(mut ep) = self.entry else {
            return Vec::new();
        };
        for lc in (1..=self.max_level).rev() {
            ep = self.greedy_closest(query, ep, lc);
        }
        let found = self.search_layer(query, ep, ef.max(k), 0, false);
        found
            .into_iter()
            .filter(|s| {
                // A tombstoned label may still map from a re-inserted seq id.
                self.label_of.get(&self.seq_of[s.label as usize]) == Some(&s.label)
            })
            .take(k)
            .map(|s| (self.seq_of[s.label as usize], s.dist))
            .collect()
    }

    fn remove(&mut self, seq_id: u32) {
        if let Some(label) = self.label_of.remove(&seq_id) {
            self.deleted.insert(label);
        }
    }

    fn get(&self, seq_id: u32) -> Option<&Vec<f32>> {
        self.label_of
            .get(&seq_id)
            .map(|&label| &self.vectors[label as usize])
    }
}

struct State {
    active: Graph,
    building: Option<Graph>,
}

/// HNSW index over one vector field. All mutation happens under the per-index
/// mutex; the periodic rebuild re-inserts live points into a fresh graph and
/// swaps it in, applying concurrent writes to both graphs in the interim.
pub struct HnswIndex {
    pub num_dim: usize,
    pub metric: VectorDistance,
    m: usize,
    ef_construction: usize,
    state: Mutex<State>,
}

impl HnswIndex {
    pub fn new(num_dim: usize, metric: VectorDistance, m: usize, ef_construction: usize) -> Self {
        Self {
            num_dim,
            metric,
            m,
            ef_construction,
            state: Mutex::new(State {
                active: Graph::new(m, ef_construction, metric),
                building: None,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().active.live_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&self, seq_id: u32, vector: Vec<f32>) {
        let mut state = self.state.lock();
        if let Some(building) = state.building.as_mut() {
            building.insert(seq_id, vector.clone());
        }
        state.active.insert(seq_id, vector);
    }

    pub fn remove(&self, seq_id: u32) {
        let mut state = self.state.lock();
        if let Some(building) = state.building.as_mut() {
            building.remove(seq_id);
        }
        state.active.remove(seq_id);
    }

    pub fn get(&self, seq_id: u32) -> Option<Vec<f32>> {
        self.state.lock().active.get(seq_id).cloned()
    }

    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> Vec<(u32, f32)> {
        self.state.lock().active.knn(query, k, ef)
    }

    pub fn distance_to(&self, seq_id: u32, query: &[f32]) -> Option<f32> {
        let state = self.state.lock();
        state
            .active
            .get(seq_id)
            .map(|v| distance(query, v, self.metric))
    }

    /// Rebuild the graph: walk the current labels in chunks, re-inserting live
    /// points into a fresh graph, then swap. The lock is released between
    /// chunks so writers only ever wait one chunk.
    pub fn rebuild(&self) {
        const CHUNK: usize = 256;

        {
            let mut state = self.state.lock();
            if state.building.is_some() {
                return;
            }
            state.building = Some(Graph::new(self.m, self.ef_construction, self.metric));
        }

        let mut cursor: usize = 0;
        loop {
            let mut state = self.state.lock();
            let total = state.active.vectors.len();
            if cursor >= total {
                let built = state.building.take().expect("rebuild in progress");
                state.active = built;
                return;
            }

            let end = (cursor + CHUNK).min(total);
            for label in cursor..end {
                let seq_id = state.active.seq_of[label];
                if state.active.label_of.get(&seq_id) != Some(&(label as u32)) {
                    continue; // tombstoned or superseded
                }
                let building = state.building.as_ref().expect("rebuild in progress");
                if building.label_of.contains_key(&seq_id) {
                    continue; // a concurrent writer already placed it
                }
                let vector = state.active.vectors[label].clone();
                state
                    .building
                    .as_mut()
                    .expect("rebuild in progress")
                    .insert(seq_id, vector);
            }
            cursor = end;
        }
    }
}
