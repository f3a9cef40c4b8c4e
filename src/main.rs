use std::fs;
use std::io::{self, BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Serialize;

use nmt_core::model::Seq2SeqWeights;
use nmt_core::{BeamSearchSession, SourceBatch, TranslateError, Translation, TranslatorConfig};

/// Beam-search translation with a recurrent seq2seq model.
///
/// Sentences are whitespace-separated token ids, one per line. Results are
/// printed as one JSON object per sentence.
#[derive(Parser, Debug)]
#[command(name = "nmt-translate", version)]
struct Cli {
    /// JSON weight file
    #[arg(long)]
    model: PathBuf,

    /// Source sentences; stdin when omitted
    #[arg(long)]
    input: Option<PathBuf>,

    /// Reference translations (starting with bos) to report a gold score
    #[arg(long)]
    targets: Option<PathBuf>,

    /// Target id per source position for copy attention; `-` for none
    #[arg(long)]
    copy_maps: Option<PathBuf>,

    #[arg(long)]
    beam_width: Option<usize>,

    #[arg(long)]
    n_best: Option<usize>,

    #[arg(long)]
    max_length: Option<usize>,

    #[arg(long)]
    min_length: Option<usize>,

    /// Length normalisation exponent
    #[arg(long)]
    alpha: Option<f32>,

    /// Coverage penalty weight
    #[arg(long)]
    beta: Option<f32>,

    /// Apply the coverage penalty while selecting candidates
    #[arg(long)]
    stepwise_penalty: bool,

    /// Write the per-round beam trace to this file
    #[arg(long)]
    trace: Option<PathBuf>,

    /// Sentences per search batch
    #[arg(long, default_value_t = 32)]
    batch_size: usize,
}

#[derive(Serialize)]
struct OutputRecord<'a> {
    sentence: usize,
    predictions: &'a [Vec<u32>],
    scores: &'a [f32],
    complete: &'a [bool],
    #[serde(skip_serializing_if = "Option::is_none")]
    gold_score: Option<f32>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        log::error!("{e}");
        eprintln!("{}", e.user_message());
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), TranslateError> {
    let model = Seq2SeqWeights::load(&cli.model)?.build()?;

    let mut config = TranslatorConfig::from_env();
    if let Some(v) = cli.beam_width {
        config.beam_width = v;
    }
    if let Some(v) = cli.n_best {
        config.n_best = v;
    }
    if let Some(v) = cli.max_length {
        config.max_length = v;
    }
    if let Some(v) = cli.min_length {
        config.min_length = v;
    }
    if let Some(v) = cli.alpha {
        config.alpha = v;
    }
    if let Some(v) = cli.beta {
        config.beta = v;
    }
    config.stepwise_penalty |= cli.stepwise_penalty;
    config.beam_trace |= cli.trace.is_some();
    config.copy_attn = model.copies();

    let sources = match &cli.input {
        Some(path) => read_ids(&fs::read_to_string(path)?, "source")?,
        None => {
            let mut text = String::new();
            for line in io::stdin().lock().lines() {
                text.push_str(&line?);
                text.push('\n');
            }
            read_ids(&text, "source")?
        }
    };
    let targets = cli.targets.as_deref().map(read_file_ids).transpose()?;
    let copy_maps = match (&cli.copy_maps, config.copy_attn) {
        (Some(path), _) => Some(read_copy_maps(&fs::read_to_string(path)?)?),
        (None, true) => Some(sources.iter().map(|s| vec![None; s.len()]).collect()),
        (None, false) => None,
    };
    if sources.is_empty() {
        log::warn!("No source sentences to translate");
        return Ok(());
    }

    let mut session = BeamSearchSession::new(model, config)?;
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let batch_size = cli.batch_size.max(1);
    for (b, chunk) in sources.chunks(batch_size).enumerate() {
        let offset = b * batch_size;
        let range = offset..offset + chunk.len();
        let mut batch = SourceBatch::new(chunk.to_vec());
        if let Some(targets) = &targets {
            batch = batch.with_targets(slice_lines(targets, &range, "targets")?);
        }
        if let Some(maps) = &copy_maps {
            batch = batch.with_copy_maps(slice_lines(maps, &range, "copy maps")?);
        }

        let translations = session.translate_batch(&batch)?;
        for (i, translation) in translations.iter().enumerate() {
            write_record(&mut out, offset + i, translation, targets.is_some())?;
        }
    }
    out.flush()?;

    if let (Some(path), Some(trace)) = (&cli.trace, session.take_trace()) {
        trace.save(path)?;
    }
    Ok(())
}

fn write_record(
    out: &mut impl Write,
    sentence: usize,
    translation: &Translation,
    with_gold: bool,
) -> Result<(), TranslateError> {
    let record = OutputRecord {
        sentence,
        predictions: &translation.predictions,
        scores: &translation.scores,
        complete: &translation.complete,
        gold_score: with_gold.then_some(translation.gold_score),
    };
    serde_json::to_writer(&mut *out, &record)?;
    writeln!(out)?;
    Ok(())
}

fn slice_lines<T: Clone>(
    lines: &[T],
    range: &std::ops::Range<usize>,
    what: &str,
) -> Result<Vec<T>, TranslateError> {
    lines.get(range.clone()).map(<[T]>::to_vec).ok_or_else(|| {
        TranslateError::Input(format!(
            "{what} has {} lines, fewer than the source",
            lines.len()
        ))
    })
}

fn read_file_ids(path: &Path) -> Result<Vec<Vec<u32>>, TranslateError> {
    read_ids(&fs::read_to_string(path)?, "target")
}

fn read_ids(text: &str, what: &str) -> Result<Vec<Vec<u32>>, TranslateError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            line.split_whitespace()
                .map(|tok| {
                    tok.parse::<u32>().map_err(|_| {
                        TranslateError::Input(format!(
                            "{what} line {}: `{tok}` is not a token id",
                            n + 1
                        ))
                    })
                })
                .collect::<Result<Vec<u32>, _>>()
        })
        .collect()
}

fn read_copy_maps(text: &str) -> Result<Vec<Vec<Option<u32>>>, TranslateError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            line.split_whitespace()
                .map(|tok| match tok {
                    "-" => Ok(None),
                    _ => tok.parse::<u32>().map(Some).map_err(|_| {
                        TranslateError::Input(format!(
                            "copy map line {}: `{tok}` is not a token id",
                            n + 1
                        ))
                    }),
                })
                .collect::<Result<Vec<Option<u32>>, _>>()
        })
        .collect()
}
