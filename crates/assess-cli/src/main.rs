//! Architecture assessment CLI

use anyhow::{bail, Context};
use assess_core::evidence::{read_log, EvidenceKind, EvidenceSource, JsonLinesLog, LogSink};
use assess_core::ingest::{
    parse_evidence_lines, AddressHint, BatchMeta, BatchReport, LabelFilter, RejectedRecord,
    META_FILE,
};
use assess_core::model::description::ModelDescription;
use assess_core::report::json;
use assess_core::{Assessment, AssessmentConfig, ClaimKind, CoreError, EvidenceRecord, Verdict};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "assess")]
#[command(about = "Match security tool evidence against a system architecture model")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate claims against evidence directories
    Evaluate {
        /// Model description (JSON)
        #[arg(short, long)]
        model: PathBuf,

        /// Evidence root directories, searched for batch metafiles
        #[arg(short, long, required = true)]
        evidence: Vec<PathBuf>,

        /// Label filter, e.g. `nmap-01,pcap` or `^noisy`
        #[arg(short, long)]
        labels: Option<String>,

        /// Append-only evidence log to write
        #[arg(long)]
        log: Option<PathBuf>,

        /// Assessment configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        output: String,

        /// Output file (defaults to stdout)
        #[arg(short = 'O', long)]
        output_file: Option<PathBuf>,

        /// Seconds allowed for reading and parsing one evidence file
        #[arg(long, default_value = "30")]
        parse_timeout: u64,
    },

    /// Rebuild verdicts from an evidence log
    Replay {
        /// Model description (JSON)
        #[arg(short, long)]
        model: PathBuf,

        /// Evidence log written by `evaluate --log`
        #[arg(long)]
        log: PathBuf,

        /// Label filter applied to the replayed evidence
        #[arg(short, long)]
        labels: Option<String>,

        /// Assessment configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        output: String,

        /// Output file (defaults to stdout)
        #[arg(short = 'O', long)]
        output_file: Option<PathBuf>,
    },

    /// List evidence that matched no model element
    Unmatched {
        /// Model description (JSON)
        #[arg(short, long)]
        model: PathBuf,

        /// Evidence root directories
        #[arg(short, long, required = true)]
        evidence: Vec<PathBuf>,

        /// Label filter
        #[arg(short, long)]
        labels: Option<String>,

        /// Seconds allowed for reading and parsing one evidence file
        #[arg(long, default_value = "30")]
        parse_timeout: u64,
    },

    /// List supported evidence kinds and claim kinds
    Kinds,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set subscriber: {}", e);
    }

    let result = match cli.command {
        Commands::Evaluate {
            model,
            evidence,
            labels,
            log,
            config,
            output,
            output_file,
            parse_timeout,
        } => {
            cmd_evaluate(
                model,
                evidence,
                labels,
                log,
                config,
                output,
                output_file,
                parse_timeout,
            )
            .await
        }
        Commands::Replay {
            model,
            log,
            labels,
            config,
            output,
            output_file,
        } => cmd_replay(model, log, labels, config, output, output_file),
        Commands::Unmatched {
            model,
            evidence,
            labels,
            parse_timeout,
        } => cmd_unmatched(model, evidence, labels, parse_timeout).await,
        Commands::Kinds => {
            cmd_kinds();
            Ok(ExitCode::Clean)
        }
    };

    match result {
        Ok(ExitCode::Clean) => {}
        Ok(ExitCode::Failed) => std::process::exit(2),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}

/// Outcome of a command that ran to completion
enum ExitCode {
    Clean,
    /// The system verdict is `Fail`
    Failed,
}

/// Evidence of one batch directory, read and parsed
struct LoadedBatch {
    dir: PathBuf,
    label: String,
    hints: Vec<AddressHint>,
    records: Vec<EvidenceRecord>,
    report: BatchReport,
}

fn load_config(path: Option<&Path>, labels: Option<String>) -> anyhow::Result<AssessmentConfig> {
    let mut config = match path {
        Some(path) => AssessmentConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => AssessmentConfig::default(),
    };
    if let Some(labels) = labels {
        config.labels = labels;
    }
    config.validate()?;
    Ok(config)
}

fn load_model(path: &Path) -> anyhow::Result<assess_core::ModelGraph> {
    let description = ModelDescription::load(path)
        .with_context(|| format!("Failed to read model {}", path.display()))?;
    let model = description
        .build()
        .with_context(|| format!("Invalid model {}", path.display()))?;
    Ok(model)
}

/// Directories below the roots that carry a batch metafile
fn discover(roots: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending: Vec<PathBuf> = roots.to_vec();
    while let Some(dir) = pending.pop() {
        if !dir.is_dir() {
            bail!("Evidence directory not found: {}", dir.display());
        }
        if dir.join(META_FILE).is_file() {
            found.push(dir.clone());
        }
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to list {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Report entry for a problem with the batch metafile itself
fn meta_failure(reason: String) -> RejectedRecord {
    RejectedRecord {
        file: META_FILE.to_string(),
        line: None,
        reason,
    }
}

/// Read and parse one batch directory.
///
/// Problems with the metafile, its address hints or any evidence file end
/// up in the batch report; they never fail the other batches. `None` when
/// the batch is not included by default.
async fn load_batch(dir: PathBuf, filter: LabelFilter, parse_timeout: Duration) -> Option<LoadedBatch> {
    let dir_label = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let meta = match BatchMeta::load(&dir) {
        Ok(Some(meta)) => meta,
        Ok(None) => return None,
        Err(e) => {
            warn!("Batch {} has an unusable metafile: {}", dir.display(), e);
            let mut report = BatchReport::new(&dir_label);
            report.file_failures.push(meta_failure(e.to_string()));
            return Some(LoadedBatch {
                dir,
                label: dir_label,
                hints: Vec::new(),
                records: Vec::new(),
                report,
            });
        }
    };
    let label = meta.label_for(&dir);
    if !meta.include && !filter.names(&label) {
        info!("Skipping batch '{}' (not included by default)", label);
        return None;
    }
    let mut report = BatchReport::new(&label);
    let hints = match meta.address_hints() {
        Ok(hints) => hints,
        Err(e) => {
            warn!("Ignoring address hints of '{}': {}", label, e);
            report.file_failures.push(meta_failure(e.to_string()));
            Vec::new()
        }
    };
    let mut records = Vec::new();

    let mut files: Vec<PathBuf> = match std::fs::read_dir(&dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.file_name().map(|n| n != META_FILE).unwrap_or(false))
            .collect(),
        Err(e) => {
            report.file_failures.push(RejectedRecord {
                file: dir.display().to_string(),
                line: None,
                reason: e.to_string(),
            });
            Vec::new()
        }
    };
    files.sort();

    for file in files {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if !meta.file_type.is_normalized() {
            report.file_failures.push(RejectedRecord {
                file: name,
                line: None,
                reason: format!("no parser for file type '{}'", meta.file_type),
            });
            continue;
        }
        let source = EvidenceSource::new(&meta.tool_name(), &name, &label);
        let parsed = tokio::time::timeout(parse_timeout, async {
            let data = tokio::fs::read_to_string(&file).await?;
            let parsed = tokio::task::spawn_blocking(move || parse_evidence_lines(&data, &source))
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            Ok::<_, std::io::Error>(parsed)
        })
        .await;
        match parsed {
            Ok(Ok((mut batch, rejected))) => {
                debug!("{}: {} record(s), {} rejected", name, batch.len(), rejected.len());
                for r in &rejected {
                    warn!("Malformed record in {}:{}: {}", r.file, r.line.unwrap_or(0), r.reason);
                }
                records.append(&mut batch);
                report.rejected.extend(rejected);
            }
            Ok(Err(e)) => report.file_failures.push(RejectedRecord {
                file: name,
                line: None,
                reason: e.to_string(),
            }),
            Err(_) => report.file_failures.push(RejectedRecord {
                file: name,
                line: None,
                reason: format!("parsing exceeded {}s", parse_timeout.as_secs()),
            }),
        }
    }

    Some(LoadedBatch {
        dir,
        label,
        hints,
        records,
        report,
    })
}

/// Seed the hints of one batch. Hints naming unknown nodes are a failure
/// of that batch only.
fn seed_batch(assessment: &Assessment, batch: &mut LoadedBatch) -> anyhow::Result<()> {
    if batch.hints.is_empty() {
        return Ok(());
    }
    match assessment.seed_addresses(&batch.label, &batch.hints) {
        Ok(_) => Ok(()),
        Err(e @ CoreError::UnknownNode(_)) => {
            warn!("Ignoring address hints of '{}': {}", batch.label, e);
            batch.report.file_failures.push(meta_failure(e.to_string()));
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("Address hints of {}", batch.dir.display())),
    }
}

/// Load all batches in parallel, seed their hints, then submit them in
/// parallel
async fn ingest(
    assessment: Arc<Assessment>,
    roots: &[PathBuf],
    parse_timeout: u64,
) -> anyhow::Result<Vec<BatchReport>> {
    let dirs = discover(roots)?;
    info!("Found {} batch director(ies)", dirs.len());
    let timeout = Duration::from_secs(parse_timeout);

    let mut loading = JoinSet::new();
    for dir in dirs {
        let filter = assessment.label_filter().clone();
        loading.spawn(load_batch(dir, filter, timeout));
    }
    let mut batches = Vec::new();
    while let Some(joined) = loading.join_next().await {
        if let Some(batch) = joined.context("Batch loader panicked")? {
            batches.push(batch);
        }
    }
    batches.sort_by(|a, b| a.dir.cmp(&b.dir));

    for batch in &mut batches {
        seed_batch(&assessment, batch)?;
    }

    let mut submitting = JoinSet::new();
    for batch in batches {
        let assessment = assessment.clone();
        submitting.spawn_blocking(move || {
            let LoadedBatch {
                label,
                records,
                report: loaded,
                ..
            } = batch;
            assessment.submit_batch(records, &label).map(|mut report| {
                report.merge(BatchReport {
                    rejected: loaded.rejected,
                    file_failures: loaded.file_failures,
                    ..BatchReport::new(&label)
                });
                report
            })
        });
    }
    let mut reports = Vec::new();
    while let Some(joined) = submitting.join_next().await {
        reports.push(joined.context("Batch submission panicked")??);
    }
    reports.sort_by(|a, b| a.label.cmp(&b.label));
    Ok(reports)
}

#[allow(clippy::too_many_arguments)]
async fn cmd_evaluate(
    model: PathBuf,
    evidence: Vec<PathBuf>,
    labels: Option<String>,
    log: Option<PathBuf>,
    config: Option<PathBuf>,
    output: String,
    output_file: Option<PathBuf>,
    parse_timeout: u64,
) -> anyhow::Result<ExitCode> {
    let config = load_config(config.as_deref(), labels)?;
    let model = load_model(&model)?;
    let mut assessment = Assessment::new(model, config)?;
    if let Some(path) = log {
        let sink: Arc<dyn LogSink> = Arc::new(
            JsonLinesLog::open(&path)
                .with_context(|| format!("Failed to open log {}", path.display()))?,
        );
        info!("Writing evidence log to {}", path.display());
        assessment = assessment.with_log(sink);
    }
    let assessment = Arc::new(assessment);

    let reports = ingest(assessment.clone(), &evidence, parse_timeout).await?;
    for report in &reports {
        print_batch(report);
    }
    render(&assessment, &output, output_file.as_deref())
}

fn cmd_replay(
    model: PathBuf,
    log: PathBuf,
    labels: Option<String>,
    config: Option<PathBuf>,
    output: String,
    output_file: Option<PathBuf>,
) -> anyhow::Result<ExitCode> {
    let config = load_config(config.as_deref(), labels)?;
    let model = load_model(&model)?;
    let entries =
        read_log(&log).with_context(|| format!("Failed to read log {}", log.display()))?;
    info!("Replaying {} entries from {}", entries.len(), log.display());
    let assessment = Assessment::replay(model, config, entries)?;
    render(&assessment, &output, output_file.as_deref())
}

async fn cmd_unmatched(
    model: PathBuf,
    evidence: Vec<PathBuf>,
    labels: Option<String>,
    parse_timeout: u64,
) -> anyhow::Result<ExitCode> {
    let config = load_config(None, labels)?;
    let assessment = Arc::new(Assessment::new(load_model(&model)?, config)?);
    ingest(assessment.clone(), &evidence, parse_timeout).await?;

    let unmatched = assessment.unmatched_evidence();
    println!("\nUnmatched Evidence ({})\n{}", unmatched.len(), "=".repeat(50));
    for item in &unmatched {
        println!("\n{} [{}]", item.summary, item.fingerprint.short());
        println!("  Source: {}", item.source);
        println!("  Reason: {}", item.reason);
    }
    let ambiguous: Vec<_> = assessment
        .review_items()
        .into_iter()
        .filter(|i| !i.candidates.is_empty())
        .collect();
    if !ambiguous.is_empty() {
        println!("\nAmbiguous ({})\n{}", ambiguous.len(), "=".repeat(50));
        for item in ambiguous {
            println!("\n{}: {}", item.summary, item.reason);
            println!("  Candidates: {}", item.candidates.join(", "));
        }
    }
    Ok(ExitCode::Clean)
}

fn cmd_kinds() {
    println!("\nEvidence Kinds\n{}", "=".repeat(50));
    for kind in [
        EvidenceKind::Flow,
        EvidenceKind::VulnerabilityScan,
        EvidenceKind::Certificate,
        EvidenceKind::SoftwareIdentity,
        EvidenceKind::ServiceScan,
        EvidenceKind::Raw,
    ] {
        println!("  - {}", kind);
    }

    println!("\nClaim Kinds\n{}", "=".repeat(50));
    for kind in [
        ClaimKind::RequiresEncryption { min_version: None },
        ClaimKind::NoKnownVulnerabilities {
            max_severity: assess_core::Severity::Medium,
        },
        ClaimKind::NoUnauthorizedFlow,
        ClaimKind::NoUnexpectedServices,
    ] {
        let targets: Vec<String> = kind
            .tag()
            .targets()
            .iter()
            .map(|t| t.to_string())
            .collect();
        println!("  - {} ({})", kind.tag(), targets.join(", "));
        println!("    {}", kind.description());
    }
}

fn print_batch(report: &BatchReport) {
    let status = if report.is_clean() { "ok" } else { "with errors" };
    info!(
        "Batch '{}' {}: {} accepted, {} duplicate, {} unmatched, {} excluded",
        report.label, status, report.accepted, report.duplicate, report.unmatched, report.excluded
    );
    for failure in report.rejected.iter().chain(report.file_failures.iter()) {
        match failure.line {
            Some(line) => warn!("  {}:{}: {}", failure.file, line, failure.reason),
            None => warn!("  {}: {}", failure.file, failure.reason),
        }
    }
}

fn render(assessment: &Assessment, output: &str, output_file: Option<&Path>) -> anyhow::Result<ExitCode> {
    let snapshot = assessment.snapshot();
    let content = match output.to_lowercase().as_str() {
        "json" => json::generate(&snapshot)?,
        "text" => text_summary(assessment),
        other => bail!("Unknown output format '{}'", other),
    };
    match output_file {
        Some(path) => {
            std::fs::write(path, &content)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Verdicts written to: {}", path.display());
        }
        None => println!("{}", content),
    }
    if snapshot.system.verdict == Verdict::Fail {
        Ok(ExitCode::Failed)
    } else {
        Ok(ExitCode::Clean)
    }
}

fn text_summary(assessment: &Assessment) -> String {
    let system = assessment.system_verdict();
    let mut out = String::new();
    out.push_str(&format!("\nClaim Verdicts: {}\n{}\n", system.system, "=".repeat(50)));

    for pair in assessment.pairs() {
        let status = match pair.verdict() {
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
            Verdict::Inconclusive => "UNKNOWN",
        };
        let scope = if pair.inherited { " (inherited)" } else { "" };
        out.push_str(&format!(
            "\n{} on {}{}: {}\n",
            pair.kind,
            assessment.model().element_name(pair.element),
            scope,
            status
        ));
        out.push_str(&format!("  {}\n", pair.evaluation.explanation));
        if let Some(pin) = &pair.pinned {
            out.push_str(&format!("  Overridden: {}\n", pin.justification));
        }
        for failed in &pair.evaluation.failing_conditions {
            out.push_str(&format!(
                "    - {}: {}\n",
                failed.condition_type.description(),
                failed.description
            ));
        }
        for conflict in &pair.conflicts {
            out.push_str(&format!(
                "  Conflict: {} supporting vs {} contradicting, resolved to {}\n",
                conflict.supporting.len(),
                conflict.contradicting.len(),
                conflict.resolved_to
            ));
        }
    }

    out.push_str(&format!("\n{}\n", "=".repeat(50)));
    for node in &system.nodes {
        out.push_str(&format!("{:<24} {}\n", node.name, node.verdict));
    }
    out.push_str(&format!(
        "\nSystem: {} ({} pass, {} fail, {} inconclusive, {} overridden)\n",
        system.verdict,
        system.counts.pass,
        system.counts.fail,
        system.counts.inconclusive,
        system.counts.overridden
    ));
    out.push_str(&format!(
        "Evidence: {} stored, {} matched, {} unmatched, {} excluded\n",
        system.evidence.total, system.evidence.matched, system.evidence.unmatched, system.evidence.excluded
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_finds_meta_dirs() {
        let root = tempfile::tempdir().unwrap();
        let batch = root.path().join("captures").join("lab-01");
        std::fs::create_dir_all(&batch).unwrap();
        std::fs::write(batch.join(META_FILE), r#"{"file_type": "evidence"}"#).unwrap();
        std::fs::create_dir_all(root.path().join("notes")).unwrap();

        let found = discover(&[root.path().to_path_buf()]).unwrap();
        assert_eq!(found, vec![batch]);
        assert!(discover(&[root.path().join("missing")]).is_err());
    }

    #[tokio::test]
    async fn test_load_batch_reports_failures() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("nmap-01");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(META_FILE), r#"{"file_type": "nmap"}"#).unwrap();
        std::fs::write(dir.join("scan.xml"), "<nmaprun/>").unwrap();

        let batch = load_batch(dir, LabelFilter::default(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(batch.label, "nmap-01");
        assert!(batch.records.is_empty());
        assert_eq!(batch.report.file_failures.len(), 1);
    }

    #[tokio::test]
    async fn test_excluded_by_default_batch() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("noisy");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(META_FILE),
            r#"{"file_type": "evidence", "include": false}"#,
        )
        .unwrap();

        let skipped = load_batch(dir.clone(), LabelFilter::default(), Duration::from_secs(5)).await;
        assert!(skipped.is_none());
        let named =
            load_batch(dir, LabelFilter::parse("noisy").unwrap(), Duration::from_secs(5)).await;
        assert!(named.is_some());
    }

    fn write_batch(root: &Path, name: &str, meta: &str, evidence: Option<&str>) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(META_FILE), meta).unwrap();
        if let Some(evidence) = evidence {
            std::fs::write(dir.join("flows.jsonl"), evidence).unwrap();
        }
    }

    #[tokio::test]
    async fn test_broken_batches_do_not_stop_healthy_ones() {
        use assess_core::model::{NodeKind, Protocol};
        use assess_core::ModelBuilder;

        let mut b = ModelBuilder::new("home");
        let device = b.add_node("device", NodeKind::Device).unwrap();
        let backend = b.add_node("backend", NodeKind::Backend).unwrap();
        b.add_address_str(device, "10.0.0.1").unwrap();
        b.add_address_str(backend, "10.0.0.2").unwrap();
        let conn = b.add_connection(device, backend, Protocol::tls(443)).unwrap();
        b.add_claim(ClaimKind::RequiresEncryption { min_version: None }, conn)
            .unwrap();
        let assessment =
            Arc::new(Assessment::new(b.build().unwrap(), AssessmentConfig::default()).unwrap());

        let root = tempfile::tempdir().unwrap();
        let flow = r#"{"kind":"flow","source":{"address":"10.0.0.1","port":40000},"destination":{"address":"10.0.0.2","port":443},"application":"tls","encryption":{"state":"handshake","succeeded":true,"version":"TLSv1.3"}}"#;
        write_batch(root.path(), "good", r#"{"file_type": "evidence"}"#, Some(flow));
        write_batch(
            root.path(),
            "hints",
            r#"{"file_type": "evidence", "addresses": {"10.0.0.9": "toaster"}}"#,
            None,
        );
        write_batch(root.path(), "unknown", r#"{"file_type": "pcap-ng"}"#, Some(flow));
        write_batch(root.path(), "untyped", r#"{"label": "x"}"#, None);

        let reports = ingest(assessment.clone(), &[root.path().to_path_buf()], 5)
            .await
            .unwrap();
        assert_eq!(reports.len(), 4);
        for report in &reports {
            match report.label.as_str() {
                "good" => {
                    assert!(report.is_clean());
                    assert_eq!(report.accepted, 1);
                }
                _ => {
                    assert_eq!(report.accepted, 0, "{}", report.label);
                    assert_eq!(report.file_failures.len(), 1, "{}", report.label);
                    assert_eq!(report.file_failures[0].file, META_FILE);
                }
            }
        }
        assert_eq!(assessment.system_verdict().verdict, Verdict::Pass);
    }
}
