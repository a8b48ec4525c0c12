//! Sample storage owned by the engine task.

use serde::Serialize;

/// One accepted tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    /// Seconds since the engine started
    pub time: f64,
    /// One reading per layout column; `None` = not read or not configured
    pub values: Vec<Option<f64>>,
}

/// Append-only columns, one per channel plus time, co-indexed by tick.
#[derive(Debug, Clone, Default)]
pub struct SampleSeries {
    time: Vec<f64>,
    columns: Vec<Vec<Option<f64>>>,
}

impl SampleSeries {
    /// Empty series with `width` channel columns.
    pub fn new(width: usize) -> Self {
        Self {
            time: Vec::new(),
            columns: vec![Vec::new(); width],
        }
    }

    /// Number of ticks held.
    pub fn len(&self) -> usize {
        self.time.len()
    }

    /// True when no tick is held.
    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Append one sample. Missing trailing values are padded with `None`.
    pub fn push(&mut self, sample: &Sample) {
        self.time.push(sample.time);
        for (index, column) in self.columns.iter_mut().enumerate() {
            column.push(sample.values.get(index).copied().flatten());
        }
    }

    /// Remove the most recent tick from every column.
    pub fn pop(&mut self) {
        if self.time.pop().is_some() {
            for column in &mut self.columns {
                column.pop();
            }
        }
    }

    /// Time column.
    pub fn times(&self) -> &[f64] {
        &self.time
    }

    /// One channel column.
    pub fn column(&self, index: usize) -> Option<&[Option<f64>]> {
        self.columns.get(index).map(Vec::as_slice)
    }

    /// Mean and deviation of every channel over ticks `from..`.
    pub fn aggregate_from(&self, from: usize) -> Vec<Aggregate> {
        self.columns
            .iter()
            .map(|column| Aggregate::of(column.get(from..).unwrap_or(&[])))
            .collect()
    }
}

/// Mean and population standard deviation of one channel over a step window.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Aggregate {
    /// Arithmetic mean, `None` if no value was present
    pub mean: Option<f64>,
    /// Population standard deviation, `None` if no value was present
    pub std_dev: Option<f64>,
}

impl Aggregate {
    /// Aggregate ignoring missing values.
    pub fn of(values: &[Option<f64>]) -> Self {
        let present: Vec<f64> = values.iter().flatten().copied().collect();
        if present.is_empty() {
            return Self::default();
        }
        let n = present.len() as f64;
        let mean = present.iter().sum::<f64>() / n;
        let variance = present.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Self {
            mean: Some(mean),
            std_dev: Some(variance.sqrt()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(time: f64, values: &[Option<f64>]) -> Sample {
        Sample {
            time,
            values: values.to_vec(),
        }
    }

    #[test]
    fn test_columns_stay_aligned() {
        let mut series = SampleSeries::new(2);
        series.push(&sample(0.0, &[Some(1.0), None]));
        series.push(&sample(1.0, &[Some(2.0)]));
        assert_eq!(series.len(), 2);
        assert_eq!(series.column(1).unwrap(), &[None, None]);

        series.pop();
        assert_eq!(series.len(), 1);
        assert_eq!(series.column(0).unwrap().len(), 1);
        series.pop();
        series.pop();
        assert!(series.is_empty());
    }

    #[test]
    fn test_aggregate_population_std() {
        let agg = Aggregate::of(&[Some(2.0), Some(4.0), None, Some(4.0), Some(4.0),
            Some(5.0), Some(5.0), Some(7.0), Some(9.0)]);
        assert_eq!(agg.mean, Some(5.0));
        assert_eq!(agg.std_dev, Some(2.0));
    }

    #[test]
    fn test_aggregate_all_missing() {
        assert_eq!(Aggregate::of(&[None, None]), Aggregate::default());
        assert_eq!(Aggregate::of(&[]), Aggregate::default());
    }

    #[test]
    fn test_aggregate_from_offset() {
        let mut series = SampleSeries::new(1);
        for (t, v) in [(0.0, 100.0), (1.0, 1.0), (2.0, 3.0)] {
            series.push(&sample(t, &[Some(v)]));
        }
        let aggs = series.aggregate_from(1);
        assert_eq!(aggs[0].mean, Some(2.0));
        assert_eq!(aggs[0].std_dev, Some(1.0));
        assert_eq!(series.aggregate_from(5)[0], Aggregate::default());
    }
}
