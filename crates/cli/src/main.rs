use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use riskshield_assess::{LlmProvider, Pipeline, RiskShieldConfig, RunOutcome};
use riskshield_core::{
    decrypt, encrypt, AssessmentResult, EncryptedBlob, EncryptionKey, FileType, Questionnaire,
    RawDocument,
};
use riskshield_index::JsonlWriter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "riskshield", version = VERSION, about = "Assess policy documents against a control questionnaire")]
struct Cli {
    /// Config file; defaults to $RISKSHIELD_CONFIG, then ./riskshield.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print a new secret for RISKSHIELD_ENCRYPTION_KEY.
    Keygen,
    Encrypt {
        input: PathBuf,
        #[arg(long)]
        out: PathBuf,
        /// File holding the secret; defaults to RISKSHIELD_ENCRYPTION_KEY.
        #[arg(long = "key-file")]
        key_file: Option<PathBuf>,
    },
    Decrypt {
        input: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long = "key-file")]
        key_file: Option<PathBuf>,
    },
    Assess {
        document: PathBuf,
        /// pdf, docx or txt; derived from the extension when omitted.
        #[arg(long = "file-type")]
        file_type: Option<String>,
        #[arg(long)]
        questions: Option<PathBuf>,
        #[arg(long = "skip-rows")]
        skip_rows: Option<usize>,
        /// Overrides the configured reasoning provider.
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        workers: Option<usize>,
        /// Copy the rendered report to this path.
        #[arg(long)]
        report: Option<PathBuf>,
        #[arg(long = "json-out")]
        json_out: Option<PathBuf>,
        #[arg(long = "jsonl-out")]
        jsonl_out: Option<PathBuf>,
    },
    /// Print the questionnaire as loaded.
    Questions {
        #[arg(long)]
        questions: Option<PathBuf>,
        #[arg(long = "skip-rows")]
        skip_rows: Option<usize>,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen => {
            let key = EncryptionKey::generate();
            println!("{}", key.to_secret().expose_secret());
            eprintln!("[riskshield] key id {}", key.key_id());
        }
        Commands::Encrypt {
            input,
            out,
            key_file,
        } => {
            let key = require_key(key_file.as_deref())?;
            let data =
                fs::read(&input).with_context(|| format!("failed to read {}", input.display()))?;
            let blob = encrypt(&data, &key)?;
            fs::write(&out, blob.to_bytes())
                .with_context(|| format!("failed to write {}", out.display()))?;
            info!(key_id = key.key_id(), bytes = data.len(), "sealed");
        }
        Commands::Decrypt {
            input,
            out,
            key_file,
        } => {
            let key = require_key(key_file.as_deref())?;
            let data =
                fs::read(&input).with_context(|| format!("failed to read {}", input.display()))?;
            let blob = EncryptedBlob::from_bytes(&data)?;
            let plaintext = decrypt(&blob, &key)?;
            fs::write(&out, plaintext)
                .with_context(|| format!("failed to write {}", out.display()))?;
        }
        Commands::Assess {
            document,
            file_type,
            questions,
            skip_rows,
            provider,
            model,
            workers,
            report,
            json_out,
            jsonl_out,
        } => {
            let mut config = RiskShieldConfig::load(cli.config.as_deref())?;
            if let Some(provider) = provider {
                config.llm.provider = provider.parse::<LlmProvider>()?;
            }
            if model.is_some() {
                config.llm.model = model;
            }
            if let Some(workers) = workers {
                config.assessment.workers = workers;
            }
            let questionnaire = load_questionnaire(&config, questions, skip_rows)?;
            let file_type = match file_type {
                Some(tag) => tag.parse::<FileType>()?,
                None => FileType::from_path(&document)?,
            };
            let bytes = fs::read(&document)
                .with_context(|| format!("failed to read {}", document.display()))?;

            let key = match EncryptionKey::from_env()? {
                Some(key) => key,
                None => {
                    warn!("RISKSHIELD_ENCRYPTION_KEY is not set; using an ephemeral key");
                    EncryptionKey::generate()
                }
            };
            let pipeline = Pipeline::from_config(&config, Arc::new(key))?;
            let outcome = pipeline.run(
                RawDocument::new(bytes, file_type),
                questionnaire.questions(),
            )?;

            if let Some(path) = report.as_deref() {
                fs::copy(&outcome.report_path, path)
                    .with_context(|| format!("failed to copy report to {}", path.display()))?;
            }
            if let Some(path) = json_out.as_deref() {
                write_json(path, &outcome.results)?;
            }
            if let Some(path) = jsonl_out.as_deref() {
                write_jsonl(path, &outcome.results)?;
            }
            print_summary(&outcome, report.as_deref());
        }
        Commands::Questions {
            questions,
            skip_rows,
        } => {
            let config = RiskShieldConfig::load(cli.config.as_deref())?;
            let questionnaire = load_questionnaire(&config, questions, skip_rows)?;
            for (idx, question) in questionnaire.questions().iter().enumerate() {
                println!("{:>3}. [{}] {}", idx + 1, question.category, question.question);
            }
        }
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn require_key(key_file: Option<&Path>) -> Result<EncryptionKey> {
    if let Some(path) = key_file {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read key file {}", path.display()))?;
        let line = content
            .lines()
            .map(|l| l.trim())
            .find(|l| !l.is_empty() && !l.starts_with('#'))
            .ok_or_else(|| anyhow!("key file is empty"))?;
        return Ok(EncryptionKey::parse(line)?);
    }
    EncryptionKey::from_env()?.ok_or_else(|| {
        anyhow!("no key: pass --key-file or set RISKSHIELD_ENCRYPTION_KEY (see `riskshield keygen`)")
    })
}

fn load_questionnaire(
    config: &RiskShieldConfig,
    path: Option<PathBuf>,
    skip_rows: Option<usize>,
) -> Result<Questionnaire> {
    let path = path.unwrap_or_else(|| config.questionnaire.path.clone());
    let skip_rows = skip_rows.or(config.questionnaire.skip_rows);
    Questionnaire::load(&path, skip_rows)
        .with_context(|| format!("failed to load questionnaire {}", path.display()))
}

fn write_json(path: &Path, results: &[AssessmentResult]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, results)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

fn write_jsonl(path: &Path, results: &[AssessmentResult]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = JsonlWriter::new(BufWriter::new(file));
    for result in results {
        writer.write_record(result)?;
    }
    let written = writer.written();
    writer.finish()?;
    info!(records = written, path = %path.display(), "results written");
    Ok(())
}

fn print_summary(outcome: &RunOutcome, copied_to: Option<&Path>) {
    for result in &outcome.results {
        println!(
            "[{}] {} :: {}",
            result.rating, result.category, result.question
        );
    }
    let incomplete = outcome
        .results
        .iter()
        .filter(|r| r.rating.is_incomplete())
        .count();
    println!(
        "[riskshield] {} questions, {} incomplete",
        outcome.results.len(),
        incomplete
    );
    println!(
        "[riskshield] report: {}",
        copied_to.unwrap_or(&outcome.report_path).display()
    );
    if let Some(url) = &outcome.report_url {
        println!("[riskshield] link:   {url}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use riskshield_core::Rating;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_assess_flags() {
        let cli = Cli::try_parse_from([
            "riskshield",
            "--config",
            "rs.toml",
            "assess",
            "policy.docx",
            "--questions",
            "controls.csv",
            "--provider",
            "local",
            "--jsonl-out",
            "out.jsonl",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("rs.toml")));
        match cli.command {
            Commands::Assess {
                document,
                questions,
                provider,
                jsonl_out,
                ..
            } => {
                assert_eq!(document, PathBuf::from("policy.docx"));
                assert_eq!(questions, Some(PathBuf::from("controls.csv")));
                assert_eq!(provider.as_deref(), Some("local"));
                assert_eq!(jsonl_out, Some(PathBuf::from("out.jsonl")));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn key_file_skips_comments() {
        let dir = tempfile::tempdir().unwrap();
        let key = EncryptionKey::generate();
        let path = dir.path().join("key.txt");
        fs::write(
            &path,
            format!("# created by keygen\n{}\n", key.to_secret().expose_secret()),
        )
        .unwrap();
        assert_eq!(require_key(Some(path.as_path())).unwrap().key_id(), key.key_id());
    }

    #[test]
    fn writes_json_and_jsonl_exports() {
        let dir = tempfile::tempdir().unwrap();
        let results = vec![AssessmentResult {
            category: "Access".into(),
            question: "Is MFA enforced?".into(),
            raw_response: "Yes.\nRating: Pass".into(),
            rating: Rating::Pass,
            evidence_score: None,
            evidence: vec!["page 1".into()],
        }];
        let json = dir.path().join("r.json");
        let jsonl = dir.path().join("r.jsonl");
        write_json(&json, &results).unwrap();
        write_jsonl(&jsonl, &results).unwrap();
        let parsed: Vec<AssessmentResult> =
            serde_json::from_str(&fs::read_to_string(&json).unwrap()).unwrap();
        assert_eq!(parsed, results);
        let lines = fs::read_to_string(&jsonl).unwrap();
        assert_eq!(lines.lines().count(), 1);
        assert!(lines.contains("\"evidence_score\":null"));
    }
}
