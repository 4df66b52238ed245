//! Replica deduplication and resolution scoping of a [`Queryable`].

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use newpromql::{
    storage::{self, LabelMatcher, Queryable, SelectHints, Series},
    value::Sample,
    Labels,
};
use tokio_util::sync::CancellationToken;

/// A view over a [`Queryable`] that caps the resolution of the data it reads
/// and merges series that differ only in replica labels.
pub struct DedupQueryable {
    inner: Arc<dyn Queryable>,
    replica_labels: Vec<String>,
    max_resolution_millis: i64,
}

/// Builds the request-scoped view. With no replica labels the series are
/// passed through untouched.
pub fn build_dedup_view(
    inner: Arc<dyn Queryable>,
    replica_labels: Vec<String>,
    max_resolution_millis: i64,
) -> Arc<dyn Queryable> {
    Arc::new(DedupQueryable {
        inner,
        replica_labels,
        max_resolution_millis,
    })
}

#[async_trait]
impl Queryable for DedupQueryable {
    async fn select(
        &self,
        matchers: &[LabelMatcher],
        hints: &SelectHints,
        cancel: &CancellationToken,
    ) -> storage::Result<Vec<Series>> {
        let hints = SelectHints {
            max_resolution_millis: self.max_resolution_millis,
            ..*hints
        };
        let series = self.inner.select(matchers, &hints, cancel).await?;
        if self.replica_labels.is_empty() {
            return Ok(series);
        }
        Ok(dedup_series(series, &self.replica_labels))
    }
}

/// Merges series whose label sets are equal once `replica_labels` are
/// removed.
///
/// A merged series has one sample per distinct timestamp of its members.
/// When several members have a sample at the same timestamp, the member with
/// the smallest original label set wins, i.e. the lexicographically smallest
/// replica label values. The result is sorted by the remaining labels.
pub fn dedup_series(series: Vec<Series>, replica_labels: &[String]) -> Vec<Series> {
    let mut groups = BTreeMap::<Labels, Vec<Series>>::new();
    for s in series {
        groups
            .entry(s.labels.without(replica_labels))
            .or_default()
            .push(s);
    }

    groups
        .into_iter()
        .map(|(labels, mut members)| {
            if members.len() == 1 {
                let mut member = members.remove(0);
                member.labels = labels;
                return member;
            }
            members.sort_by(|a, b| a.labels.cmp(&b.labels));
            let mut samples = BTreeMap::<i64, f64>::new();
            for member in &members {
                for sample in &member.samples {
                    samples.entry(sample.timestamp).or_insert(sample.value);
                }
            }
            Series::new(
                labels,
                samples
                    .into_iter()
                    .map(|(t, v)| Sample::new(t, v))
                    .collect(),
            )
        })
        .collect()
}
