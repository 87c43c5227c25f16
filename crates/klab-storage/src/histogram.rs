// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Bounded streaming histogram
//!
//! Numeric values are kept as at most `max_bins` centroid bins; when a new
//! value pushes the count over the bound, the two closest adjacent bins are
//! merged. Global statistics (min, max, count, sum, sum of squares) are exact
//! and independent of binning, so merging histograms in any order gives the
//! same totals.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One centroid bin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramBin {
    pub mean: f64,
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub sum_squared: f64,
}

impl HistogramBin {
    fn single(value: f64) -> Self {
        Self {
            mean: value,
            count: 1,
            min: value,
            max: value,
            sum: value,
            sum_squared: value * value,
        }
    }

    fn absorb(&mut self, other: &HistogramBin) {
        self.count += other.count;
        self.sum += other.sum;
        self.sum_squared += other.sum_squared;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.mean = self.sum / self.count as f64;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingHistogram {
    max_bins: usize,
    bins: Vec<HistogramBin>,
    count: u64,
    sum: f64,
    sum_squared: f64,
    min: f64,
    max: f64,
    missing_count: u64,
    categories: BTreeMap<String, u64>,
}

impl StreamingHistogram {
    pub fn new(max_bins: usize) -> Self {
        Self {
            max_bins: max_bins.max(1),
            bins: Vec::new(),
            count: 0,
            sum: 0.0,
            sum_squared: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            missing_count: 0,
            categories: BTreeMap::new(),
        }
    }

    /// Record a numeric value; NaN counts as missing
    pub fn insert(&mut self, value: f64) {
        if value.is_nan() {
            self.missing_count += 1;
            return;
        }
        self.count += 1;
        self.sum += value;
        self.sum_squared += value * value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.add_bin(HistogramBin::single(value));
    }

    pub fn insert_missing(&mut self) {
        self.missing_count += 1;
    }

    /// Record a categorical value
    pub fn insert_category(&mut self, category: &str) {
        *self.categories.entry(category.to_string()).or_insert(0) += 1;
    }

    /// Fold `other` into `self`
    pub fn merge(&mut self, other: &StreamingHistogram) {
        self.count += other.count;
        self.sum += other.sum;
        self.sum_squared += other.sum_squared;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.missing_count += other.missing_count;
        for (category, n) in &other.categories {
            *self.categories.entry(category.clone()).or_insert(0) += n;
        }
        for bin in &other.bins {
            self.add_bin(bin.clone());
        }
    }

    fn add_bin(&mut self, bin: HistogramBin) {
        let position = self.bins.partition_point(|b| b.mean < bin.mean);
        match self.bins.get_mut(position) {
            Some(existing) if existing.mean == bin.mean => existing.absorb(&bin),
            _ => self.bins.insert(position, bin),
        }
        while self.bins.len() > self.max_bins {
            self.merge_closest();
        }
    }

    fn merge_closest(&mut self) {
        let closest = self
            .bins
            .windows(2)
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                let gap_a = a[1].mean - a[0].mean;
                let gap_b = b[1].mean - b[0].mean;
                gap_a.total_cmp(&gap_b)
            })
            .map(|(i, _)| i);
        if let Some(i) = closest {
            let right = self.bins.remove(i + 1);
            self.bins[i].absorb(&right);
        }
    }

    pub fn max_bins(&self) -> usize {
        self.max_bins
    }

    pub fn bins(&self) -> &[HistogramBin] {
        &self.bins
    }

    pub fn categories(&self) -> &BTreeMap<String, u64> {
        &self.categories
    }

    /// Number of non-missing numeric values
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn missing_count(&self) -> u64 {
        self.missing_count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn sum_squared(&self) -> f64 {
        self.sum_squared
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// Population variance
    pub fn variance(&self) -> Option<f64> {
        self.mean().map(|mean| {
            let raw = self.sum_squared / self.count as f64 - mean * mean;
            raw.max(0.0)
        })
    }

    pub fn std_dev(&self) -> Option<f64> {
        self.variance().map(f64::sqrt)
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0 && self.missing_count == 0 && self.categories.is_empty()
    }
}
