use nmt_core::model::weights::ModelDims;
use nmt_core::model::{Seq2Seq, Seq2SeqWeights, SourceBatch, StepModel};
use nmt_core::translate::{BeamSearchSession, TranslatorConfig};
use nmt_core::TranslateError;

const TGT_VOCAB: usize = 9;
const MAX_SRC_LEN: usize = 5;

fn model(attention: bool, copy: bool, seed: u64) -> Seq2Seq {
    Seq2SeqWeights::patterned(
        ModelDims {
            src_vocab: 7,
            tgt_vocab: TGT_VOCAB,
            hidden: 6,
            max_src_len: MAX_SRC_LEN,
            attention,
            copy,
        },
        seed,
    )
    .build()
    .unwrap()
}

fn config(width: usize, n_best: usize, max_length: usize) -> TranslatorConfig {
    TranslatorConfig {
        beam_width: width,
        n_best,
        max_length,
        ..Default::default()
    }
}

fn batch() -> SourceBatch {
    SourceBatch::new(vec![vec![1, 2, 3], vec![4, 5], vec![6, 1, 2, 3, 4]])
}

#[test]
fn test_attention_model_translates_batch() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut session = BeamSearchSession::new(model(true, false, 7), config(4, 2, 8)).unwrap();
    let batch = batch();
    let out = session.translate_batch(&batch).unwrap();

    assert_eq!(out.len(), 3);
    for (translation, source) in out.iter().zip(&batch.sources) {
        assert_eq!(translation.predictions.len(), 2);
        for (prediction, attention) in translation.predictions.iter().zip(&translation.attention) {
            assert!(!prediction.is_empty() && prediction.len() <= 8);
            assert!(prediction.iter().all(|&t| (t as usize) < TGT_VOCAB));
            assert_eq!(attention.dim(), (prediction.len(), source.len()));
            for row in attention.outer_iter() {
                assert!((row.sum() - 1.0).abs() < 1e-4);
            }
        }
        assert!(translation.scores.iter().all(|s| s.is_finite()));
    }
}

#[test]
fn test_plain_decoder_reports_zero_attention() {
    let mut session = BeamSearchSession::new(model(false, false, 3), config(3, 1, 6)).unwrap();
    let out = session.translate_batch(&batch()).unwrap();
    for translation in &out {
        assert!(translation.attention[0].iter().all(|&a| a == 0.0));
    }
}

#[test]
fn test_repeated_batches_give_identical_results() {
    let mut session = BeamSearchSession::new(model(true, false, 11), config(3, 2, 8)).unwrap();
    let first = session.translate_batch(&batch()).unwrap();
    let second = session.translate_batch(&batch()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_gold_score_of_reference_is_negative() {
    let mut session = BeamSearchSession::new(model(true, false, 5), config(2, 1, 6)).unwrap();
    let batch = SourceBatch::new(vec![vec![1, 2], vec![3]])
        .with_targets(vec![vec![2, 4, 5, 3], vec![2, 6, 3]]);
    let out = session.translate_batch(&batch).unwrap();
    for translation in &out {
        assert!(translation.gold_score.is_finite());
        assert!(translation.gold_score < 0.0);
    }
}

#[test]
fn test_copy_model_translates_with_copy_maps() {
    let copy_model = model(true, true, 13);
    assert!(copy_model.copies());
    let cfg = TranslatorConfig {
        copy_attn: true,
        ..config(3, 2, 6)
    };
    let mut session = BeamSearchSession::new(copy_model, cfg).unwrap();
    let batch = SourceBatch::new(vec![vec![1, 2, 3], vec![4, 5]])
        .with_copy_maps(vec![vec![Some(4), None, None], vec![None, Some(6)]]);
    let out = session.translate_batch(&batch).unwrap();

    for (translation, source) in out.iter().zip(&batch.sources) {
        assert_eq!(translation.predictions.len(), 2);
        assert!(translation.scores.iter().all(|s| s.is_finite()));
        for prediction in &translation.predictions {
            assert!(prediction.len() <= 6);
            assert!(prediction
                .iter()
                .all(|&t| (t as usize) < TGT_VOCAB + source.len()));
        }
    }
}

#[test]
fn test_copy_mode_requires_copy_maps() {
    let cfg = TranslatorConfig {
        copy_attn: true,
        ..config(2, 1, 4)
    };
    let mut session = BeamSearchSession::new(model(true, true, 13), cfg).unwrap();
    assert!(matches!(
        session.translate_batch(&batch()),
        Err(TranslateError::Input(_))
    ));
}

#[test]
fn test_source_longer_than_model_limit_fails() {
    let mut session = BeamSearchSession::new(model(true, false, 1), config(2, 1, 4)).unwrap();
    let too_long = SourceBatch::new(vec![vec![1; MAX_SRC_LEN + 1]]);
    assert!(matches!(
        session.translate_batch(&too_long),
        Err(TranslateError::Model(_))
    ));
}

#[test]
fn test_saved_weights_reload_to_same_model() {
    let weights = Seq2SeqWeights::patterned(
        ModelDims {
            src_vocab: 7,
            tgt_vocab: TGT_VOCAB,
            hidden: 4,
            max_src_len: MAX_SRC_LEN,
            attention: true,
            copy: false,
        },
        21,
    );
    let path = std::env::temp_dir().join(format!("nmt-weights-{}.json", std::process::id()));
    weights.save(&path).unwrap();
    let reloaded = Seq2SeqWeights::load(&path).unwrap().build().unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(reloaded.target_vocab_size(), TGT_VOCAB);
    let run = |m: Seq2Seq| {
        BeamSearchSession::new(m, config(3, 1, 6))
            .unwrap()
            .translate_batch(&batch())
            .unwrap()
    };
    let original = run(weights.build().unwrap());
    let restored = run(reloaded);
    for (a, b) in original.iter().zip(&restored) {
        assert_eq!(a.predictions, b.predictions);
    }
}
