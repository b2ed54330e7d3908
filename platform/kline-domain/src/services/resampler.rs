use crate::errors::ResampleError;
use crate::value_objects::candle::{Candle, Completeness, DerivedCandle};
use crate::value_objects::resolution::Resolution;
use crate::value_objects::series::{SeriesKey, TimeSeries};

/// Aggregates a strictly increasing base series into `target` buckets.
///
/// Buckets with fewer than `target / base` inputs are still emitted but tagged
/// [`Completeness::Partial`]; buckets with no input are not emitted at all.
pub fn resample(series: &TimeSeries, target: Resolution) -> Result<Vec<DerivedCandle>, ResampleError> {
    let inputs: Vec<DerivedCandle> = series
        .candles
        .iter()
        .map(|candle| DerivedCandle {
            candle: candle.clone(),
            completeness: Completeness::Complete,
            base_count: 1,
            expected_count: 1,
        })
        .collect();
    resample_derived(&series.key, &inputs, target)
}

/// Same as [`resample`] but over already-derived candles of `key.resolution`.
/// A bucket built from any partial input is itself partial.
pub fn resample_derived(
    key: &SeriesKey,
    inputs: &[DerivedCandle],
    target: Resolution,
) -> Result<Vec<DerivedCandle>, ResampleError> {
    let ratio = key
        .resolution
        .buckets_in(target)
        .ok_or(ResampleError::IncompatibleResolution {
            source_resolution: key.resolution,
            target,
        })?;

    for (index, input) in inputs.iter().enumerate() {
        if !input.candle.belongs_to(key) {
            return Err(ResampleError::ForeignCandle {
                key: key.clone(),
                open_time: input.open_time(),
            });
        }
        if index > 0 && inputs[index - 1].open_time() >= input.open_time() {
            return Err(ResampleError::UnorderedInput {
                key: key.clone(),
                index,
            });
        }
    }

    let target_key = key.with_resolution(target);
    let mut output = Vec::new();
    let mut bucket: Option<Bucket> = None;

    for input in inputs {
        let bucket_start = target.align(input.open_time());
        match bucket.as_mut() {
            Some(active) if active.open_time == bucket_start => active.absorb(input),
            _ => {
                if let Some(done) = bucket.take() {
                    output.push(done.finish(&target_key, ratio));
                }
                bucket = Some(Bucket::start(bucket_start, input));
            }
        }
    }

    if let Some(done) = bucket {
        output.push(done.finish(&target_key, ratio));
    }

    Ok(output)
}

struct Bucket {
    open_time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    inputs: i64,
    base_count: u32,
    expected_per_input: u32,
    all_complete: bool,
}

impl Bucket {
    fn start(open_time: i64, input: &DerivedCandle) -> Self {
        let c = &input.candle;
        Self {
            open_time,
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
            inputs: 1,
            base_count: input.base_count,
            expected_per_input: input.expected_count,
            all_complete: input.is_complete(),
        }
    }

    fn absorb(&mut self, input: &DerivedCandle) {
        let c = &input.candle;
        self.high = self.high.max(c.high);
        self.low = self.low.min(c.low);
        self.close = c.close;
        self.volume += c.volume;
        self.inputs += 1;
        self.base_count = self.base_count.saturating_add(input.base_count);
        self.all_complete &= input.is_complete();
    }

    fn finish(self, key: &SeriesKey, ratio: i64) -> DerivedCandle {
        let completeness = if self.inputs == ratio && self.all_complete {
            Completeness::Complete
        } else {
            Completeness::Partial
        };
        let expected_count = u32::try_from(ratio)
            .unwrap_or(u32::MAX)
            .saturating_mul(self.expected_per_input.max(1));
        DerivedCandle {
            candle: Candle {
                exchange: key.exchange,
                symbol: key.symbol.clone(),
                resolution: key.resolution,
                open_time: self.open_time,
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
                volume: self.volume,
                source_seq: None,
            },
            completeness,
            base_count: self.base_count,
            expected_count,
        }
    }
}
