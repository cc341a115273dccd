//! Tests for the optical receiver and symbol translation.

use safe_controller::morse::{self, UNKNOWN};
use safe_controller::otp::OtpText;
use safe_controller::signal::{
    decode_symbols, decode_symbols_with, Reject, SignalDecoder, DEBOUNCE_MS, LETTER_GAP_MS,
    WORD_GAP_MS,
};

// ============================================================================
// Tests for morse translation
// ============================================================================

#[test]
fn test_translate_letters_and_digits() {
    assert_eq!(morse::translate(".-"), 'A');
    assert_eq!(morse::translate("--.."), 'Z');
    assert_eq!(morse::translate("-----"), '0');
    assert_eq!(morse::translate("----."), '9');
}

#[test]
fn test_translate_unknown_group() {
    assert_eq!(morse::translate("........"), UNKNOWN);
    assert_eq!(morse::translate(""), UNKNOWN);
}

// ============================================================================
// Tests for decode_symbols
// ============================================================================

#[test]
fn test_decode_word_break_counts_toward_length() {
    // A, word break, B, C: four characters
    assert_eq!(
        decode_symbols(".- / -... -.-.", 5),
        Err(Reject::LengthMismatch { decoded: 4 })
    );
    assert_eq!(decode_symbols(".- / -... -.-.", 4).unwrap().as_str(), "A BC");
}

#[test]
fn test_decode_exact_length() {
    let text = decode_symbols(".- .---- -... ..--- -.-.", 5).unwrap();
    assert_eq!(text.as_str(), "A1B2C");
}

#[test]
fn test_decode_double_gap_rejected_before_translation() {
    let mut calls = 0;
    let result = decode_symbols_with(".-  -...", 2, |_| {
        calls += 1;
        'X'
    });
    assert_eq!(result, Err(Reject::DoubleGap));
    assert_eq!(calls, 0);
}

#[test]
fn test_decode_too_long_rejected_before_translation() {
    let long = ". ".repeat(60);
    let mut calls = 0;
    let result = decode_symbols_with(&long, 5, |_| {
        calls += 1;
        'E'
    });
    assert_eq!(result, Err(Reject::TooLong));
    assert_eq!(calls, 0);
}

#[test]
fn test_decode_empty() {
    assert_eq!(decode_symbols("", 5), Err(Reject::Empty));
    assert_eq!(decode_symbols("   ", 5), Err(Reject::Empty));
}

#[test]
fn test_decode_unknown_group_keeps_marker() {
    let text = decode_symbols(".- ........ -...", 3).unwrap();
    assert_eq!(text.as_str(), "A?B");
}

// ============================================================================
// Tests for SignalDecoder
// ============================================================================

const LIGHT: u16 = 3_000;
const DARK: u16 = 0;

/// Build a light/dark schedule for `letters`, each given as dot/dash groups.
fn schedule(letters: &[&str]) -> Vec<(bool, u64)> {
    let mut out = vec![(false, 100)];
    for (i, letter) in letters.iter().enumerate() {
        if i > 0 {
            out.push((false, 280));
        }
        for (j, symbol) in letter.chars().enumerate() {
            if j > 0 {
                out.push((false, 70));
            }
            out.push((true, if symbol == '-' { 210 } else { 70 }));
        }
    }
    out.push((false, 2_000));
    out
}

fn level_at(schedule: &[(bool, u64)], t: u64) -> u16 {
    let mut start = 0;
    for &(light, duration) in schedule {
        if t < start + duration {
            return if light { LIGHT } else { DARK };
        }
        start += duration;
    }
    DARK
}

fn run(decoder: &mut SignalDecoder, schedule: &[(bool, u64)]) -> Vec<Result<OtpText, Reject>> {
    let total: u64 = schedule.iter().map(|&(_, d)| d).sum();
    let mut results = Vec::new();
    let mut t = 0;
    while t <= total {
        if let Some(r) = decoder.poll(t, || Some(level_at(schedule, t))) {
            results.push(r);
        }
        t += 5;
    }
    results
}

#[test]
fn test_decoder_receives_full_code() {
    let mut decoder = SignalDecoder::new(5);
    let results = run(&mut decoder, &schedule(&[".-", ".----", "-...", "..---", "-.-."]));
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].as_ref().unwrap().as_str(), "A1B2C");
    assert!(!decoder.is_active());
}

#[test]
fn test_decoder_rejects_short_code() {
    let mut decoder = SignalDecoder::new(5);
    let results = run(&mut decoder, &schedule(&[".-", "-..."]));
    assert_eq!(results, vec![Err(Reject::LengthMismatch { decoded: 2 })]);
}

#[test]
fn test_decoder_active_only_during_transmission() {
    let mut decoder = SignalDecoder::new(5);
    let s = schedule(&["."]);
    // Before the first pulse ends
    for t in (0..=150).step_by(5) {
        decoder.poll(t, || Some(level_at(&s, t)));
    }
    assert!(!decoder.is_active());
    for t in (155..=400).step_by(5) {
        decoder.poll(t, || Some(level_at(&s, t)));
    }
    assert!(decoder.is_active());
}

#[test]
fn test_decoder_skips_sampling_between_intervals() {
    let mut decoder = SignalDecoder::new(5);
    let mut sampled = 0;
    for t in 0..20 {
        decoder.poll(t, || {
            sampled += 1;
            Some(DARK)
        });
    }
    // 0, 5, 10, 15
    assert_eq!(sampled, 4);
}

#[test]
fn test_decoder_ignores_missing_samples() {
    let mut decoder = SignalDecoder::new(5);
    for t in (0..2_000).step_by(5) {
        assert_eq!(decoder.poll(t, || None), None);
    }
    assert!(!decoder.is_active());
}

#[test]
fn test_steady_light_is_not_a_pulse() {
    let mut decoder = SignalDecoder::new(5);
    let s = vec![(false, 100), (true, 1_500), (false, 2_000)];
    let results = run(&mut decoder, &s);
    assert!(results.is_empty());
    assert!(!decoder.is_active());
}

// The 3-sample average reports a light-to-dark edge two samples (10 ms) after
// it happens; dark-to-light edges are seen on the first light sample.
const FALL_LAG_MS: u64 = 10;

/// Two dots separated by `dark` ms, decoded with the given code length.
fn two_dots(dark: u64, otp_len: usize) -> Vec<Result<OtpText, Reject>> {
    let s = vec![(false, 100), (true, 70), (false, dark), (true, 70), (false, 2_000)];
    run(&mut SignalDecoder::new(otp_len), &s)
}

#[test]
fn test_bounce_inside_pulse_is_ignored() {
    // A 20 ms dropout 20 ms into a 170 ms pulse. The dropout is seen 30 ms
    // after the rising edge, inside the debounce window.
    let s = vec![(false, 100), (true, 20), (false, 20), (true, 130), (false, 2_000)];
    assert!(20 + FALL_LAG_MS < DEBOUNCE_MS);

    let mut decoder = SignalDecoder::new(1);
    let results = run(&mut decoder, &s);
    // Timed from the rising edge the pulse is a dash; timed from the bounce
    // it would be a dot.
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].as_ref().unwrap().as_str(), "T");
}

#[test]
fn test_gap_below_letter_threshold_joins_symbols() {
    let results = two_dots(LETTER_GAP_MS + FALL_LAG_MS - 5, 1);
    assert_eq!(results[0].as_ref().unwrap().as_str(), "I");
}

#[test]
fn test_gap_at_letter_threshold_splits_letters() {
    let results = two_dots(LETTER_GAP_MS + FALL_LAG_MS, 2);
    assert_eq!(results[0].as_ref().unwrap().as_str(), "EE");
}

#[test]
fn test_gap_below_word_threshold_is_letter_gap() {
    let results = two_dots(WORD_GAP_MS + FALL_LAG_MS - 5, 2);
    assert_eq!(results[0].as_ref().unwrap().as_str(), "EE");
}

#[test]
fn test_gap_at_word_threshold_splits_words() {
    let results = two_dots(WORD_GAP_MS + FALL_LAG_MS, 3);
    assert_eq!(results[0].as_ref().unwrap().as_str(), "E E");
}
