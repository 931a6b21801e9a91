// Copyright 2021-Present Datadog, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Relative tolerance used when comparing bucket parameters of two
/// distributions for merge compatibility.
const BUCKET_PARAM_TOLERANCE: f64 = 1e-5;

/// The bucketing scheme of a [`Distribution`].
///
/// Parametric schemes (linear, exponential) carry `num_finite_buckets + 2`
/// bucket counts: one underflow bucket, the finite buckets, and one overflow
/// bucket. The explicit scheme carries `bounds.len() + 1` counts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketScheme {
    /// `num_finite_buckets` buckets of equal `width`, starting at `offset`.
    Linear {
        /// Number of finite buckets.
        num_finite_buckets: i32,
        /// Width of each finite bucket.
        width: f64,
        /// Lower bound of the first finite bucket.
        offset: f64,
    },
    /// Buckets with exponentially growing widths: bucket `i` covers
    /// `[scale * growth_factor^(i-1), scale * growth_factor^i)`.
    Exponential {
        /// Number of finite buckets.
        num_finite_buckets: i32,
        /// Ratio between the widths of consecutive buckets, `> 1`.
        growth_factor: f64,
        /// Lower bound of the first finite bucket, `> 0`.
        scale: f64,
    },
    /// Buckets separated by an explicit, strictly increasing list of bounds.
    Explicit {
        /// The bucket boundaries.
        bounds: Vec<f64>,
    },
}

/// A histogram of `f64` samples: a bucketing scheme plus summary statistics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    /// Total number of samples.
    pub count: i64,
    /// Arithmetic mean of the samples, `0` when empty.
    pub mean: f64,
    /// Sum of squared deviations from the mean, `0` when empty.
    pub sum_of_squared_deviation: f64,
    /// Smallest sample, meaningful only when `count > 0`.
    pub minimum: f64,
    /// Largest sample, meaningful only when `count > 0`.
    pub maximum: f64,
    /// Per-bucket sample counts; the length is determined by the scheme.
    pub bucket_counts: Vec<i64>,
    /// The bucketing scheme.
    pub buckets: BucketScheme,
}

/// Error returned by distribution construction and merging.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum DistributionError {
    /// `num_finite_buckets` was zero or negative.
    #[error("num_finite_buckets must be > 0, got {0}")]
    InvalidNumFiniteBuckets(i32),
    /// A linear scheme was given a non-positive width.
    #[error("width must be > 0.0, got {0}")]
    InvalidWidth(f64),
    /// An exponential scheme was given a growth factor of at most one.
    #[error("growth_factor must be > 1.0, got {0}")]
    InvalidGrowthFactor(f64),
    /// An exponential scheme was given a non-positive scale.
    #[error("scale must be > 0.0, got {0}")]
    InvalidScale(f64),
    /// Explicit bounds were not sorted.
    #[error("explicit bucket bounds must be sorted")]
    UnsortedBounds,
    /// Explicit bounds contained two equal adjacent values.
    #[error("explicit bucket bounds must not contain duplicates")]
    DuplicateBounds,
    /// The two distributions use different bucketing schemes.
    #[error("bucketing schemes do not match")]
    IncompatibleBuckets,
    /// The two distributions carry a different number of bucket counts.
    #[error("bucket counts lengths do not match: {left} vs {right}")]
    BucketCountMismatch {
        /// Number of buckets on the left-hand side.
        left: usize,
        /// Number of buckets on the right-hand side.
        right: usize,
    },
}

fn close_enough(left: f64, right: f64) -> bool {
    (left - right).abs() <= BUCKET_PARAM_TOLERANCE * left.abs()
}

impl BucketScheme {
    fn num_buckets(&self) -> usize {
        match self {
            BucketScheme::Linear {
                num_finite_buckets, ..
            }
            | BucketScheme::Exponential {
                num_finite_buckets, ..
            } => *num_finite_buckets as usize + 2,
            BucketScheme::Explicit { bounds } => bounds.len() + 1,
        }
    }

    /// Returns whether the two schemes are equal up to a small relative
    /// tolerance on their floating-point parameters.
    fn approx_eq(&self, other: &BucketScheme) -> bool {
        match (self, other) {
            (
                BucketScheme::Linear {
                    num_finite_buckets: left_num,
                    width: left_width,
                    offset: left_offset,
                },
                BucketScheme::Linear {
                    num_finite_buckets: right_num,
                    width: right_width,
                    offset: right_offset,
                },
            ) => {
                left_num == right_num
                    && close_enough(*left_width, *right_width)
                    && close_enough(*left_offset, *right_offset)
            }
            (
                BucketScheme::Exponential {
                    num_finite_buckets: left_num,
                    growth_factor: left_growth,
                    scale: left_scale,
                },
                BucketScheme::Exponential {
                    num_finite_buckets: right_num,
                    growth_factor: right_growth,
                    scale: right_scale,
                },
            ) => {
                left_num == right_num
                    && close_enough(*left_growth, *right_growth)
                    && close_enough(*left_scale, *right_scale)
            }
            (
                BucketScheme::Explicit { bounds: left_bounds },
                BucketScheme::Explicit {
                    bounds: right_bounds,
                },
            ) => {
                left_bounds.len() == right_bounds.len()
                    && left_bounds
                        .iter()
                        .zip(right_bounds)
                        .all(|(left, right)| close_enough(*left, *right))
            }
            _ => false,
        }
    }
}

impl Distribution {
    /// Creates an empty distribution with linear buckets.
    pub fn linear(num_finite_buckets: i32, width: f64, offset: f64) -> Result<Self, DistributionError> {
        if num_finite_buckets <= 0 {
            return Err(DistributionError::InvalidNumFiniteBuckets(num_finite_buckets));
        }
        if width <= 0.0 {
            return Err(DistributionError::InvalidWidth(width));
        }
        Ok(Self::empty(BucketScheme::Linear {
            num_finite_buckets,
            width,
            offset,
        }))
    }

    /// Creates an empty distribution with exponential buckets.
    pub fn exponential(
        num_finite_buckets: i32,
        growth_factor: f64,
        scale: f64,
    ) -> Result<Self, DistributionError> {
        if num_finite_buckets <= 0 {
            return Err(DistributionError::InvalidNumFiniteBuckets(num_finite_buckets));
        }
        if growth_factor <= 1.0 {
            return Err(DistributionError::InvalidGrowthFactor(growth_factor));
        }
        if scale <= 0.0 {
            return Err(DistributionError::InvalidScale(scale));
        }
        Ok(Self::empty(BucketScheme::Exponential {
            num_finite_buckets,
            growth_factor,
            scale,
        }))
    }

    /// Creates an empty distribution with explicit bucket bounds. The bounds
    /// must be strictly increasing.
    pub fn explicit(bounds: Vec<f64>) -> Result<Self, DistributionError> {
        if !bounds.windows(2).all(|pair| pair[0] <= pair[1]) {
            return Err(DistributionError::UnsortedBounds);
        }
        if bounds.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(DistributionError::DuplicateBounds);
        }
        Ok(Self::empty(BucketScheme::Explicit { bounds }))
    }

    fn empty(buckets: BucketScheme) -> Self {
        let num_buckets = buckets.num_buckets();
        Distribution {
            count: 0,
            mean: 0.0,
            sum_of_squared_deviation: 0.0,
            minimum: 0.0,
            maximum: 0.0,
            bucket_counts: vec![0; num_buckets],
            buckets,
        }
    }

    /// Records one sample, updating the summary statistics and the bucket the
    /// sample falls into.
    ///
    /// The running mean and the sum of squared deviations follow Welford's
    /// recurrence, which keeps intermediate values small and the result
    /// numerically stable across mixed-magnitude samples.
    pub fn add_sample(&mut self, value: f64) {
        if self.count == 0 {
            self.count = 1;
            self.minimum = value;
            self.maximum = value;
            self.mean = value;
            self.sum_of_squared_deviation = 0.0;
        } else {
            let count = self.count as f64;
            let mean = self.mean;
            let new_mean = (count * mean + value) / (count + 1.0);
            self.sum_of_squared_deviation += (value - mean) * (value - new_mean);
            self.count += 1;
            self.minimum = self.minimum.min(value);
            self.maximum = self.maximum.max(value);
            self.mean = new_mean;
        }
        let bucket_index = self.bucket_index(value);
        self.bucket_counts[bucket_index] += 1;
    }

    /// Returns the index of the bucket `value` falls into. NaN samples land
    /// in the lowest bucket.
    fn bucket_index(&self, value: f64) -> usize {
        match &self.buckets {
            BucketScheme::Linear {
                num_finite_buckets,
                width,
                offset,
            } => {
                let num_finite_buckets = *num_finite_buckets as usize;
                let upper_bound = offset + num_finite_buckets as f64 * width;
                if value < *offset || value.is_nan() {
                    0
                } else if value >= upper_bound {
                    num_finite_buckets + 1
                } else {
                    1 + ((value - offset) / width) as usize
                }
            }
            BucketScheme::Exponential {
                num_finite_buckets,
                growth_factor,
                scale,
            } => {
                let num_finite_buckets = *num_finite_buckets as usize;
                if value >= *scale {
                    let bucket_index =
                        1 + ((value / scale).log2() / growth_factor.log2()) as usize;
                    bucket_index.min(num_finite_buckets + 1)
                } else {
                    0
                }
            }
            BucketScheme::Explicit { bounds } => {
                // Index of the first bound strictly greater than the value;
                // NaN compares false against every bound and lands in 0.
                bounds.partition_point(|&bound| bound <= value)
            }
        }
    }

    /// Merges `other` into `self`.
    ///
    /// The two distributions must use the same bucketing scheme, up to a
    /// small relative tolerance on the parameters. Summary statistics are
    /// compounded and bucket counts added elementwise.
    pub fn merge_from(&mut self, other: &Distribution) -> Result<(), DistributionError> {
        if !self.buckets.approx_eq(&other.buckets) {
            return Err(DistributionError::IncompatibleBuckets);
        }
        if self.bucket_counts.len() != other.bucket_counts.len() {
            return Err(DistributionError::BucketCountMismatch {
                left: self.bucket_counts.len(),
                right: other.bucket_counts.len(),
            });
        }
        if other.count <= 0 {
            return Ok(());
        }
        if self.count <= 0 {
            *self = other.clone();
            return Ok(());
        }

        let count = self.count as f64;
        let mean = self.mean;
        let other_count = other.count as f64;

        self.count += other.count;
        self.minimum = self.minimum.min(other.minimum);
        self.maximum = self.maximum.max(other.maximum);
        self.mean = (count * mean + other_count * other.mean) / self.count as f64;
        self.sum_of_squared_deviation += other.sum_of_squared_deviation
            + count * (self.mean - mean) * (self.mean - mean)
            + other_count * (self.mean - other.mean) * (self.mean - other.mean);

        for (bucket_count, other_bucket_count) in
            self.bucket_counts.iter_mut().zip(&other.bucket_counts)
        {
            *bucket_count += other_bucket_count;
        }
        Ok(())
    }
}
