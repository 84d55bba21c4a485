//! Greedy and beam search against a deterministic fake decoder

mod common;

use std::sync::Mutex;
use std::sync::atomic::Ordering;

use common::{EOS, FakeDecoder};
use ts_core::{CancellationToken, NullProgress, ProgressRecord};
use ts_generate::{EarlyStopping, GenerateError, GenerateOptions, Search, SearchContext};

fn context<'a>(cancel: &'a CancellationToken, progress: &'a NullProgress) -> SearchContext<'a> {
    SearchContext {
        cache_size: 1,
        encoder_hidden_states: None,
        cancel,
        progress,
    }
}

#[test]
fn greedy_stops_at_max_length_or_eos() {
    let model = FakeDecoder::new(false);
    let options = GenerateOptions::greedy().with_max_length(12);
    let search = Search::new(options, EOS).unwrap();
    let cancel = CancellationToken::new();
    let progress = NullProgress;

    let result = search.greedy(&model, model.start(), &context(&cancel, &progress)).unwrap();
    assert!(result.tokens.len() <= 12);
    assert!(result.tokens.len() == 12 || result.tokens.last() == Some(&EOS));
    assert_eq!(result.tokens[0], 0);
    assert!(result.score <= 0.0);

    // First call forwards the prompt, every later call uses the cached branch
    let calls = model.calls.load(Ordering::SeqCst);
    assert_eq!(calls, result.generated.len());
    assert_eq!(model.branch_calls.load(Ordering::SeqCst), calls - 1);
}

#[test]
fn greedy_is_deterministic_for_a_seed() {
    let options = GenerateOptions {
        top_k: 5,
        top_p: 0.9,
        temperature: 1.3,
        ..GenerateOptions::default().with_seed(11).with_max_length(15)
    };
    let cancel = CancellationToken::new();
    let progress = NullProgress;
    let run = || {
        let model = FakeDecoder::new(false);
        Search::new(options.clone(), EOS)
            .unwrap()
            .greedy(&model, model.start(), &context(&cancel, &progress))
            .unwrap()
    };
    assert_eq!(run(), run());
}

#[test]
fn single_beam_matches_greedy() {
    for seed in [0, 3, 42] {
        let options = GenerateOptions {
            beams: 1,
            top_k: 6,
            top_p: 0.95,
            temperature: 0.9,
            ..GenerateOptions::default().with_seed(seed).with_max_length(14)
        };
        let cancel = CancellationToken::new();
        let progress = NullProgress;
        let search = Search::new(options, EOS).unwrap();

        let model = FakeDecoder::new(false);
        let greedy = search
            .greedy(&model, model.start(), &context(&cancel, &progress))
            .unwrap();
        let model = FakeDecoder::new(false);
        let beams = search
            .beam(&model, model.start(), &context(&cancel, &progress))
            .unwrap();

        assert_eq!(beams.len(), 1);
        assert_eq!(beams[0], greedy, "seed {seed}");
    }
}

#[test]
fn beams_ranked_best_first() {
    let options = GenerateOptions {
        early_stopping: EarlyStopping::Exhaustive,
        ..GenerateOptions::beam(3).with_max_length(10)
    };
    let model = FakeDecoder::new(true);
    let cancel = CancellationToken::new();
    let progress = NullProgress;
    let results = Search::new(options, EOS)
        .unwrap()
        .beam(&model, model.start(), &context(&cancel, &progress))
        .unwrap();

    assert!(!results.is_empty() && results.len() <= 3);
    for pair in results.windows(2) {
        assert!(pair[0].rank_score >= pair[1].rank_score);
    }
    for result in &results {
        assert!(result.tokens.len() <= 10);
    }
}

#[test]
fn best_beam_stopping_keeps_the_best_result() {
    let cancel = CancellationToken::new();
    let progress = NullProgress;
    for seed in 0..20 {
        for beams in [2, 3] {
            for length_penalty in [1.0, 2.0] {
                let run = |early_stopping| {
                    let options = GenerateOptions {
                        top_k: 8,
                        top_p: 1.0,
                        length_penalty,
                        early_stopping,
                        ..GenerateOptions::beam(beams).with_seed(seed).with_max_length(12)
                    };
                    let model = FakeDecoder::new(false);
                    Search::new(options, EOS)
                        .unwrap()
                        .beam(&model, model.start(), &context(&cancel, &progress))
                        .unwrap()
                };
                let early = run(EarlyStopping::BestBeam);
                let full = run(EarlyStopping::Exhaustive);
                assert_eq!(
                    early[0], full[0],
                    "seed {seed}, beams {beams}, length penalty {length_penalty}"
                );
            }
        }
    }
}

#[test]
fn diversity_penalty_marks_repeats() {
    let options = GenerateOptions {
        top_k: 8,
        top_p: 1.0,
        diversity_length: 1,
        diversity_penalty: 2.5,
        early_stopping: EarlyStopping::Exhaustive,
        ..GenerateOptions::beam(4).with_max_length(6)
    };
    let model = FakeDecoder::new(false);
    let cancel = CancellationToken::new();
    let progress = NullProgress;
    let results = Search::new(options, EOS)
        .unwrap()
        .with_special_tokens([0, EOS])
        .beam(&model, model.start(), &context(&cancel, &progress))
        .unwrap();

    for result in &results {
        assert!(result.penalty_score == 0.0 || result.penalty_score == 2.5);
        let expected = (result.score - result.penalty_score) / (result.tokens.len() as f32);
        approx::assert_relative_eq!(result.rank_score, expected, epsilon = 1e-5);
    }
}

#[test]
fn cancelled_before_first_step() {
    let model = FakeDecoder::new(false);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let progress = NullProgress;
    let search = Search::new(GenerateOptions::beam(2), EOS).unwrap();

    let error = search
        .beam(&model, model.start(), &context(&cancel, &progress))
        .unwrap_err();
    assert_eq!(error, GenerateError::Cancelled);
    assert!(error.is_cancelled());
    assert_eq!(model.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn greedy_reports_progress_each_token() {
    let model = FakeDecoder::new(false);
    let cancel = CancellationToken::new();
    let seen = Mutex::new(Vec::new());
    let sink = |record: ProgressRecord| seen.lock().unwrap().push(record.step);
    let search = Search::new(GenerateOptions::greedy().with_max_length(8), EOS).unwrap();
    let context = SearchContext {
        cache_size: 1,
        encoder_hidden_states: None,
        cancel: &cancel,
        progress: &sink,
    };
    let result = search.greedy(&model, model.start(), &context).unwrap();

    let steps = seen.lock().unwrap().clone();
    assert_eq!(steps, (1..=result.generated.len()).collect::<Vec<_>>());
}

#[test]
fn no_repeat_ngram_holds_in_output() {
    let options = GenerateOptions {
        no_repeat_ngram_size: 2,
        ..GenerateOptions::greedy().with_max_length(16)
    };
    let model = FakeDecoder::new(false);
    let cancel = CancellationToken::new();
    let progress = NullProgress;
    let result = Search::new(options, EOS)
        .unwrap()
        .greedy(&model, model.start(), &context(&cancel, &progress))
        .unwrap();

    let mut bigrams = std::collections::HashSet::new();
    for pair in result.tokens.windows(2) {
        assert!(bigrams.insert((pair[0], pair[1])), "repeated bigram {pair:?}");
    }
}
