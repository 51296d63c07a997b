use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use rollcall_core::{
    BatchRecognitionPipeline, Config, Embedding, EmbeddingGallery, EuclideanMatcher, FeedReader,
    IdentityProfile, Matcher, PrecomputedEmbedder,
};
use rollcall_ledger::{AttendanceEvent, AttendanceQuery, FailoverLedger, LedgerOptions};
use serde::Deserialize;
use std::io::{BufRead, Read};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-embedding attendance tool", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register an identity, or replace its embedding
    Register {
        /// Identity key (e.g. student id)
        identity: String,
        /// JSON file with one embedding vector ("-" for stdin)
        #[arg(short, long)]
        embedding: PathBuf,
        /// Add as an extra sample instead of replacing
        #[arg(long)]
        sample: bool,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        group: Option<String>,
    },
    /// Remove an identity and all of its embeddings
    Remove { identity: String },
    /// List registered identities
    List,
    /// Show gallery statistics
    Stats,
    /// Remove every identity from the gallery
    Clear {
        /// Required confirmation
        #[arg(long)]
        yes: bool,
    },
    /// Match one embedding, or a list of embeddings (one per face), against the gallery
    Identify {
        #[arg(short, long)]
        embedding: PathBuf,
    },
    /// Check one embedding against a claimed identity
    Verify {
        identity: String,
        #[arg(short, long)]
        embedding: PathBuf,
    },
    /// Record one attendance event
    Mark {
        identity: String,
        #[arg(short, long, default_value_t = 100.0)]
        confidence: f32,
        #[arg(long)]
        group: Option<String>,
        /// Observation time (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Query attendance records
    Attendance {
        #[arg(long)]
        identity: Option<String>,
        #[arg(long)]
        group: Option<String>,
        /// Inclusive lower bound on created_at (RFC 3339)
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        /// Inclusive upper bound on created_at (RFC 3339)
        #[arg(long)]
        to: Option<DateTime<Utc>>,
    },
    /// Run batch recognition over a JSON-lines frame feed
    Batch {
        /// Feed file ("-" for stdin)
        #[arg(short, long)]
        feed: PathBuf,
        /// Process every Nth frame
        #[arg(long)]
        stride: Option<usize>,
        /// Store one attendance record per recognized identity
        #[arg(long)]
        record: bool,
        #[arg(long)]
        group: Option<String>,
    },
}

/// Accepted embedding file shapes.
#[derive(Deserialize)]
#[serde(untagged)]
enum VectorInput {
    One(Vec<f32>),
    Many(Vec<Vec<f32>>),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("loading configuration")?;
    let gallery = || EmbeddingGallery::load(&config.gallery_path, config.embedding_dim);
    let matcher = EuclideanMatcher::new(config.tolerance);

    match cli.command {
        Commands::Register {
            identity,
            embedding,
            sample,
            name,
            group,
        } => {
            let vector = match read_vectors(&embedding)? {
                VectorInput::One(v) => Embedding::new(v),
                VectorInput::Many(_) => bail!("register expects exactly one vector"),
            };
            let g = gallery();
            let outcome = if sample {
                g.add_sample(&identity, vector)?
            } else {
                g.set_single(&identity, vector)?
            };
            if name.is_some() || group.is_some() {
                let current = g.profile(&identity).unwrap_or_default();
                g.set_profile(
                    &identity,
                    IdentityProfile {
                        name: name.or(current.name),
                        group: group.or(current.group),
                    },
                )?;
            }
            println!("{identity}: {outcome:?}");
        }
        Commands::Remove { identity } => {
            gallery().remove(&identity)?;
            println!("Removed {identity}");
        }
        Commands::List => {
            let g = gallery();
            let ids = g.list_identities();
            if ids.is_empty() {
                println!("No identities registered");
            }
            for id in ids {
                let samples = g.records(&id).len();
                match g.profile(&id) {
                    Some(IdentityProfile {
                        name: Some(name), ..
                    }) => println!("{id}\t{name}\t{samples} sample(s)"),
                    _ => println!("{id}\t-\t{samples} sample(s)"),
                }
            }
        }
        Commands::Stats => {
            println!("{}", serde_json::to_string_pretty(&gallery().stats())?);
        }
        Commands::Clear { yes } => {
            if !yes {
                bail!("refusing to clear the gallery without --yes");
            }
            gallery().clear()?;
            println!("Gallery cleared");
        }
        Commands::Identify { embedding } => {
            let g = gallery();
            let candidates = g.snapshot();
            let results = match read_vectors(&embedding)? {
                VectorInput::One(v) => vec![matcher.find_best_match(&Embedding::new(v), &candidates)?],
                VectorInput::Many(vs) => {
                    let queries: Vec<Embedding> = vs.into_iter().map(Embedding::new).collect();
                    matcher.match_multi(&queries, &candidates)?
                }
            };
            for r in &results {
                match &r.identity_id {
                    Some(id) => println!("{id}\tdistance={:.4}\tconfidence={:.1}", r.distance, r.confidence),
                    None => println!(
                        "-\tdistance={:.4}\tconfidence={:.1}\t{}",
                        r.distance,
                        r.confidence,
                        r.message()
                    ),
                }
            }
        }
        Commands::Verify { identity, embedding } => {
            let query = match read_vectors(&embedding)? {
                VectorInput::One(v) => Embedding::new(v),
                VectorInput::Many(_) => bail!("verify expects exactly one vector"),
            };
            let v = gallery().verify(&identity, &query, &matcher)?;
            println!(
                "{}\tdistance={:.4}\tconfidence={:.1}",
                if v.is_match { "match" } else { "no match" },
                v.distance,
                v.confidence
            );
        }
        Commands::Mark {
            identity,
            confidence,
            group,
            at,
        } => {
            let ledger = open_ledger(&config).await;
            let event = AttendanceEvent::new(identity, confidence)
                .with_group(group.or_else(|| config.group_id.clone()))
                .with_metadata("source", "manual")
                .at(at);
            let stored = ledger.insert(event).await?;
            println!("{}", serde_json::to_string_pretty(&stored.record)?);
        }
        Commands::Attendance {
            identity,
            group,
            from,
            to,
        } => {
            let ledger = open_ledger(&config).await;
            let query = AttendanceQuery {
                identity_id: identity,
                group_id: group,
                from,
                to,
            };
            let stats = ledger.stats(&query).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Batch {
            feed,
            stride,
            record,
            group,
        } => {
            let pipeline = BatchRecognitionPipeline::new(stride.unwrap_or(config.batch_stride))?;
            let g = gallery();
            let tally = pipeline.process(
                FeedReader::new(open_input(&feed)?),
                &mut PrecomputedEmbedder,
                &matcher,
                &g,
            );
            let summary = tally.summarize();

            if record {
                let ledger = open_ledger(&config).await;
                let group = group.or_else(|| config.group_id.clone());
                for row in &summary {
                    let event = AttendanceEvent::new(row.identity_id.clone(), row.avg_confidence)
                        .with_group(group.clone())
                        .with_metadata("source", "batch")
                        .with_metadata("sightings", row.count);
                    let stored = ledger.insert(event).await?;
                    tracing::info!(identity = %row.identity_id, backend = ?stored.backend, "batch attendance recorded");
                }
            }

            let out = serde_json::json!({
                "summary": summary,
                "meta": tally,
                "stride": pipeline.stride(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
    }

    Ok(())
}

async fn open_ledger(config: &Config) -> FailoverLedger {
    let ledger = FailoverLedger::open(LedgerOptions {
        primary_db_path: config.primary_db_path.clone(),
        fallback_path: config.fallback_path.clone(),
        backend_timeout: config.backend_timeout(),
        probe_timeout: config.probe_timeout(),
    });
    ledger.probe().await;
    ledger
}

fn open_input(path: &Path) -> Result<Box<dyn BufRead>> {
    if path == Path::new("-") {
        return Ok(Box::new(std::io::stdin().lock()));
    }
    let file = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    Ok(Box::new(std::io::BufReader::new(file)))
}

fn read_vectors(path: &Path) -> Result<VectorInput> {
    let mut text = String::new();
    open_input(path)?
        .read_to_string(&mut text)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not a vector or list of vectors", path.display()))
}
