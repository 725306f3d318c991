//! Reachability matrix: expected and observed connectivity per ordered pod pair
//!
//! The matrix is dense over the pods it was built from. Every ordered pair,
//! self pairs included, holds exactly one expectation; hairpin scenarios
//! exercise the self pair like any other cell. The pod set is fixed at
//! construction and never tracks later topology changes.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::Serialize;
use svcval_common::Error;

use crate::model::{Pod, PodKey};
use crate::peer::Peer;

/// Aggregate of a matrix after observation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    /// Number of ordered pairs
    pub total: usize,
    /// Pairs where expected != observed (unobserved pairs count as `false`)
    pub wrong: usize,
    /// Pairs observed connected
    pub true_observations: usize,
    /// Pairs observed not connected
    pub false_observations: usize,
    /// Pairs never observed
    pub unobserved: usize,
}

/// Expected/observed connectivity over a fixed set of pods
#[derive(Clone, Debug)]
pub struct Reachability {
    keys: Vec<PodKey>,
    index: BTreeMap<PodKey, usize>,
    expected: Vec<bool>,
    observed: Vec<Option<bool>>,
}

impl Reachability {
    /// Build a matrix over `pods` with every pair expecting `default_expectation`
    pub fn new(pods: &[Pod], default_expectation: bool) -> Self {
        let keys: Vec<PodKey> = pods.iter().map(Pod::key).collect();
        let index = keys
            .iter()
            .enumerate()
            .map(|(i, k)| (k.clone(), i))
            .collect();
        let n = keys.len();
        Self {
            keys,
            index,
            expected: vec![default_expectation; n * n],
            observed: vec![None; n * n],
        }
    }

    /// Pods the matrix covers, in construction order
    pub fn peers(&self) -> &[PodKey] {
        &self.keys
    }

    /// Number of ordered pairs
    pub fn pair_count(&self) -> usize {
        self.expected.len()
    }

    /// Every ordered pair as `(from, to)`
    pub fn pairs(&self) -> impl Iterator<Item = (&PodKey, &PodKey)> + '_ {
        self.keys
            .iter()
            .flat_map(move |from| self.keys.iter().map(move |to| (from, to)))
    }

    fn cell(&self, from: &PodKey, to: &PodKey) -> Option<usize> {
        let f = self.index.get(from)?;
        let t = self.index.get(to)?;
        Some(f * self.keys.len() + t)
    }

    fn cell_or_err(&self, from: &PodKey, to: &PodKey) -> Result<usize, Error> {
        self.cell(from, to).ok_or_else(|| {
            Error::validation(format!("pair {} -> {} is not in the matrix", from, to))
        })
    }

    /// Override the expectation of every pair matched by the selectors
    ///
    /// Returns the number of concrete pairs touched. Later calls win over
    /// earlier ones for the same pair.
    pub fn expect_peer(&mut self, from: &Peer, to: &Peer, expected: bool) -> usize {
        let n = self.keys.len();
        let mut touched = 0;
        for (f, from_key) in self.keys.iter().enumerate() {
            if !from.matches(from_key) {
                continue;
            }
            for (t, to_key) in self.keys.iter().enumerate() {
                if to.matches(to_key) {
                    self.expected[f * n + t] = expected;
                    touched += 1;
                }
            }
        }
        touched
    }

    /// Override the expectation of one concrete pair
    pub fn expect(&mut self, from: &PodKey, to: &PodKey, expected: bool) -> Result<(), Error> {
        let cell = self.cell_or_err(from, to)?;
        self.expected[cell] = expected;
        Ok(())
    }

    /// Expected value of a pair
    pub fn expected(&self, from: &PodKey, to: &PodKey) -> Option<bool> {
        self.cell(from, to).map(|c| self.expected[c])
    }

    /// Observed value of a pair (`None` until recorded)
    pub fn observed(&self, from: &PodKey, to: &PodKey) -> Option<bool> {
        self.cell(from, to).and_then(|c| self.observed[c])
    }

    /// Record an observation
    pub fn observe(&mut self, from: &PodKey, to: &PodKey, connected: bool) -> Result<(), Error> {
        let cell = self.cell_or_err(from, to)?;
        self.observed[cell] = Some(connected);
        Ok(())
    }

    /// Forget every observation, keeping expectations
    pub fn clear_observations(&mut self) {
        self.observed.iter_mut().for_each(|o| *o = None);
    }

    /// Expect no source to reach `to`
    pub fn force_unexpected_destination(&mut self, to: &PodKey) -> Result<(), Error> {
        let t = *self
            .index
            .get(to)
            .ok_or_else(|| Error::validation(format!("destination {} is not in the matrix", to)))?;
        let n = self.keys.len();
        for f in 0..n {
            self.expected[f * n + t] = false;
        }
        Ok(())
    }

    /// Single reduction over every cell
    pub fn summary(&self) -> Summary {
        let mut summary = Summary {
            total: self.expected.len(),
            ..Default::default()
        };
        for (expected, observed) in self.expected.iter().zip(&self.observed) {
            match observed {
                Some(true) => summary.true_observations += 1,
                Some(false) => summary.false_observations += 1,
                None => summary.unobserved += 1,
            }
            if *expected != observed.unwrap_or(false) {
                summary.wrong += 1;
            }
        }
        summary
    }

    /// Every pair whose observation disagrees with its expectation
    pub fn wrong_pairs(&self) -> Vec<(PodKey, PodKey)> {
        self.pairs()
            .zip(self.expected.iter().zip(&self.observed))
            .filter(|(_, (expected, observed))| **expected != observed.unwrap_or(false))
            .map(|((from, to), _)| (from.clone(), to.clone()))
            .collect()
    }

    /// Expected values as a text table
    pub fn render_expected(&self) -> String {
        self.render(|cell| if self.expected[cell] { "X" } else { "." })
    }

    /// Observed values as a text table (`?` for unobserved)
    pub fn render_observed(&self) -> String {
        self.render(|cell| match self.observed[cell] {
            Some(true) => "X",
            Some(false) => ".",
            None => "?",
        })
    }

    /// Mismatches as a text table (`X` where expected != observed)
    pub fn render_comparison(&self) -> String {
        self.render(|cell| {
            if self.expected[cell] == self.observed[cell].unwrap_or(false) {
                "."
            } else {
                "X"
            }
        })
    }

    fn render<F>(&self, mark: F) -> String
    where
        F: Fn(usize) -> &'static str,
    {
        let labels: Vec<String> = self.keys.iter().map(PodKey::to_string).collect();
        let width = labels.iter().map(String::len).max().unwrap_or(1).max(1);
        let n = self.keys.len();

        let mut out = String::new();
        let mut line = format!("{:width$}", "-", width = width);
        for label in &labels {
            let _ = write!(line, " {:width$}", label, width = width);
        }
        out.push_str(line.trim_end());
        out.push('\n');
        for (f, label) in labels.iter().enumerate() {
            let mut line = format!("{:width$}", label, width = width);
            for t in 0..n {
                let _ = write!(line, " {:width$}", mark(f * n + t), width = width);
            }
            out.push_str(line.trim_end());
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Container, Model, Protocol};

    fn pods() -> Vec<Pod> {
        let model = Model::new(
            &["x", "y"],
            &["a", "b"],
            &[Container::new(80, Protocol::Tcp)],
        )
        .unwrap();
        model.all_pods().to_vec()
    }

    fn key(ns: &str, name: &str) -> PodKey {
        PodKey::new(ns, name)
    }

    #[test]
    fn every_pair_including_self_gets_the_default() {
        let r = Reachability::new(&pods(), true);
        assert_eq!(r.pair_count(), 16);
        assert_eq!(r.pairs().count(), 16);
        assert_eq!(r.expected(&key("x", "a"), &key("x", "a")), Some(true));
        assert_eq!(r.expected(&key("y", "b"), &key("x", "a")), Some(true));
        assert_eq!(r.expected(&key("z", "a"), &key("x", "a")), None);
        assert_eq!(r.observed(&key("x", "a"), &key("x", "b")), None);
    }

    #[test]
    fn namespace_selector_overrides_whole_block() {
        let mut r = Reachability::new(&pods(), false);
        let touched = r.expect_peer(&Peer::namespace("x"), &Peer::namespace("y"), true);
        assert_eq!(touched, 4);
        assert_eq!(r.expected(&key("x", "a"), &key("y", "b")), Some(true));
        assert_eq!(r.expected(&key("y", "a"), &key("x", "b")), Some(false));
        assert_eq!(r.expected(&key("x", "a"), &key("x", "b")), Some(false));
    }

    #[test]
    fn last_write_wins_for_matched_pairs_only() {
        let mut r = Reachability::new(&pods(), true);
        let from = Peer::namespace("x");
        let to = Peer::pod("y", "a");
        r.expect_peer(&from, &to, true);
        r.expect_peer(&from, &to, false);

        for (f, t) in r.pairs() {
            let matched = from.matches(f) && to.matches(t);
            assert_eq!(r.expected(f, t), Some(!matched), "{} -> {}", f, t);
        }
    }

    #[test]
    fn summary_counts_mismatches_in_one_pass() {
        let mut r = Reachability::new(&pods(), true);
        for (f, t) in r.pairs().map(|(f, t)| (f.clone(), t.clone())).collect::<Vec<_>>() {
            r.observe(&f, &t, true).unwrap();
        }
        r.observe(&key("x", "a"), &key("y", "b"), false).unwrap();

        let s = r.summary();
        assert_eq!(s.total, 16);
        assert_eq!(s.wrong, 1);
        assert_eq!(s.true_observations, 15);
        assert_eq!(s.false_observations, 1);
        assert_eq!(s.unobserved, 0);
        assert_eq!(r.wrong_pairs(), vec![(key("x", "a"), key("y", "b"))]);
    }

    #[test]
    fn unobserved_pairs_count_as_not_connected() {
        let r = Reachability::new(&pods(), true);
        let s = r.summary();
        assert_eq!(s.unobserved, 16);
        assert_eq!(s.wrong, 16);

        let r = Reachability::new(&pods(), false);
        assert_eq!(r.summary().wrong, 0);
    }

    #[test]
    fn forcing_a_destination_clears_its_column() {
        let mut r = Reachability::new(&pods(), true);
        r.force_unexpected_destination(&key("x", "b")).unwrap();
        for from in r.peers().to_vec() {
            assert_eq!(r.expected(&from, &key("x", "b")), Some(false));
            assert_eq!(r.expected(&from, &key("x", "a")), Some(true));
        }
        assert!(r.force_unexpected_destination(&key("z", "q")).is_err());
    }

    #[test]
    fn unknown_pairs_are_rejected() {
        let mut r = Reachability::new(&pods(), true);
        assert!(r.expect(&key("x", "a"), &key("x", "zz"), false).is_err());
        assert!(r.observe(&key("zz", "a"), &key("x", "a"), true).is_err());
    }

    #[test]
    fn comparison_table_marks_mismatches() {
        let two = Model::new(&["x"], &["a", "b"], &[Container::new(80, Protocol::Tcp)]).unwrap();
        let mut r = Reachability::new(two.all_pods(), true);
        r.observe(&key("x", "a"), &key("x", "a"), true).unwrap();
        r.observe(&key("x", "a"), &key("x", "b"), false).unwrap();
        r.observe(&key("x", "b"), &key("x", "a"), true).unwrap();
        r.observe(&key("x", "b"), &key("x", "b"), true).unwrap();

        let table = r.render_comparison();
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with('-'));
        assert_eq!(lines[1].split_whitespace().collect::<Vec<_>>(), vec!["x/a", ".", "X"]);
        assert_eq!(lines[2].split_whitespace().collect::<Vec<_>>(), vec!["x/b", ".", "."]);

        let observed = r.render_observed();
        assert!(observed.lines().nth(1).unwrap().ends_with('.'));
    }
}
