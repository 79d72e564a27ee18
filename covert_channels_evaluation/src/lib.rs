// Scoring of a covert channel run: what was sent against what came out.

pub mod message;

pub use message::{BitMessage, MessageError, MAX_MSG_SIZE};

use num_rational::Rational64;
use serde::{Deserialize, Serialize};
use std::iter::Sum;
use std::ops::{Add, AddAssign};

/// Fraction in [0, 1] of sent bits recovered at the right position.
///
/// Received bits past the end of the message are ignored, missing ones
/// count as errors.
pub fn accuracy(sent: &[bool], received: &[bool]) -> f64 {
    if sent.is_empty() {
        return if received.is_empty() { 1.0 } else { 0.0 };
    }
    let matching = sent
        .iter()
        .zip(received.iter())
        .filter(|(s, r)| s == r)
        .count();
    matching as f64 / sent.len() as f64
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelError {
    pub true_zero: usize,
    pub true_one: usize,
    pub false_one: usize,
    pub false_zero: usize,
    /// Sent but never received.
    pub missing: usize,
    /// Received past the end of the message.
    pub extra: usize,
}

impl ChannelError {
    pub fn compare(sent: &[bool], received: &[bool]) -> Self {
        let mut error = ChannelError::default();
        for (s, r) in sent.iter().zip(received.iter()) {
            match (s, r) {
                (false, false) => error.true_zero += 1,
                (true, true) => error.true_one += 1,
                (false, true) => error.false_one += 1,
                (true, false) => error.false_zero += 1,
            }
        }
        error.missing = sent.len().saturating_sub(received.len());
        error.extra = received.len().saturating_sub(sent.len());
        error
    }

    pub fn bit_transmitted(&self) -> usize {
        self.true_one + self.false_one + self.true_zero + self.false_zero + self.missing
    }

    pub fn one_received(&self) -> usize {
        self.true_one + self.false_one
    }

    pub fn zero_received(&self) -> usize {
        self.true_zero + self.false_zero
    }

    pub fn bit_error(&self) -> usize {
        self.false_zero + self.false_one + self.missing
    }

    pub fn error_rate(&self) -> f64 {
        if self.bit_transmitted() == 0 {
            return 0.0;
        }
        self.bit_error() as f64 / self.bit_transmitted() as f64
    }

    pub fn error_ratio(&self) -> Rational64 {
        if self.bit_transmitted() == 0 {
            return Rational64::from_integer(0);
        }
        Rational64::new(self.bit_error() as i64, self.bit_transmitted() as i64)
    }

    pub fn accuracy(&self) -> f64 {
        1.0 - self.error_rate()
    }
}

impl AddAssign<&Self> for ChannelError {
    fn add_assign(&mut self, rhs: &Self) {
        self.true_zero += rhs.true_zero;
        self.true_one += rhs.true_one;
        self.false_zero += rhs.false_zero;
        self.false_one += rhs.false_one;
        self.missing += rhs.missing;
        self.extra += rhs.extra;
    }
}

impl AddAssign<Self> for ChannelError {
    fn add_assign(&mut self, rhs: Self) {
        *self += &rhs;
    }
}

impl Add for ChannelError {
    type Output = ChannelError;

    fn add(mut self, rhs: Self) -> Self::Output {
        self += rhs;
        self
    }
}

impl Sum<Self> for ChannelError {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(ChannelError::default(), |a, b| a + b)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TransmissionResult {
    pub bits_transmitted: usize,
    pub error: ChannelError,
    pub stale_slots: usize,
    pub time_rdtsc: u64,
    pub time_seconds: std::time::Duration,
}

impl TransmissionResult {
    /// Raw bits per second.
    pub fn capacity(&self) -> f64 {
        if self.time_seconds.is_zero() {
            return 0.0;
        }
        self.bits_transmitted as f64 / self.time_seconds.as_secs_f64()
    }

    /// Capacity of the equivalent binary symmetric channel.
    pub fn true_capacity(&self) -> f64 {
        let p = self.error.error_rate();
        if p == 0.0 || p == 1.0 {
            self.capacity()
        } else {
            self.capacity() * (1.0 + ((1.0 - p) * f64::log2(1.0 - p) + p * f64::log2(p)))
        }
    }

    pub fn csv(&self) -> String {
        format!(
            "{},{},{},{},{},{}",
            self.bits_transmitted,
            self.error.bit_error(),
            self.error.error_rate(),
            self.stale_slots,
            self.time_rdtsc,
            self.time_seconds.as_nanos()
        )
    }

    pub fn csv_header() -> String {
        "bits_transmitted,bits_error,error_rate,stale_slots,time_rdtsc,time_nanosec".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn bits(s: &str) -> Vec<bool> {
        s.bytes().map(|b| b == b'1').collect()
    }

    #[test]
    fn identical_streams_are_fully_accurate() {
        let sent = bits("10110010");
        assert_eq!(accuracy(&sent, &sent), 1.0);
    }

    #[test]
    fn accuracy_counts_positions() {
        assert_eq!(accuracy(&bits("1011"), &bits("1001")), 0.75);
        // short receive: missing bits are errors
        assert_eq!(accuracy(&bits("1011"), &bits("10")), 0.5);
        // long receive: extra bits ignored
        assert_eq!(accuracy(&bits("1011"), &bits("101100")), 1.0);
    }

    #[test]
    fn empty_message_accuracy() {
        assert_eq!(accuracy(&[], &[]), 1.0);
        assert_eq!(accuracy(&[], &bits("1")), 0.0);
    }

    #[test]
    fn confusion_matrix() {
        let e = ChannelError::compare(&bits("110010"), &bits("1000"));
        assert_eq!(e.true_one, 1);
        assert_eq!(e.false_zero, 1);
        assert_eq!(e.true_zero, 2);
        assert_eq!(e.false_one, 0);
        assert_eq!(e.missing, 2);
        assert_eq!(e.extra, 0);
        assert_eq!(e.bit_transmitted(), 6);
        assert_eq!(e.bit_error(), 3);
        assert_eq!(e.error_ratio(), Rational64::new(1, 2));
        assert_eq!(e.accuracy(), accuracy(&bits("110010"), &bits("1000")));
    }

    #[test]
    fn errors_add_up() {
        let a = ChannelError::compare(&bits("10"), &bits("11"));
        let b = ChannelError::compare(&bits("01"), &bits("01"));
        let total: ChannelError = vec![a, b].into_iter().sum();
        assert_eq!(total.bit_transmitted(), 4);
        assert_eq!(total.false_one, 1);
        assert_eq!(total.true_one, 2);
    }

    #[test]
    fn capacity_of_a_clean_run() {
        let sent = bits("1010");
        let r = TransmissionResult {
            bits_transmitted: 4,
            error: ChannelError::compare(&sent, &sent),
            stale_slots: 0,
            time_rdtsc: 1_000,
            time_seconds: Duration::from_secs(2),
        };
        assert_eq!(r.capacity(), 2.0);
        assert_eq!(r.true_capacity(), 2.0);
        assert_eq!(r.csv(), "4,0,0,0,1000,2000000000");
    }

    #[test]
    fn zero_duration_has_no_capacity() {
        let sent = bits("1010");
        let r = TransmissionResult {
            bits_transmitted: 4,
            error: ChannelError::compare(&sent, &bits("1000")),
            stale_slots: 0,
            time_rdtsc: 0,
            time_seconds: Duration::ZERO,
        };
        assert_eq!(r.capacity(), 0.0);
        assert_eq!(r.true_capacity(), 0.0);
    }

    #[test]
    fn noisy_run_loses_capacity() {
        let r = TransmissionResult {
            bits_transmitted: 4,
            error: ChannelError::compare(&bits("1010"), &bits("1011")),
            stale_slots: 0,
            time_rdtsc: 1_000,
            time_seconds: Duration::from_secs(1),
        };
        assert!(r.true_capacity() < r.capacity());
    }
}
