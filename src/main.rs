use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use sowstore::config::{LogProtocol, LoggingTarget};
use sowstore::{Key, KeyValue, Record, ServerConfig, Table, TableRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sowstore")]
#[command(about = "Inspect and maintain durable state-of-the-world topics")]
struct Cli {
    /// JSON server configuration
    #[arg(long, short)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Recover every configured topic and report its state
    Check,
    /// Insert or replace one record
    Put {
        #[arg(long)]
        topic: String,
        #[arg(long)]
        data: String,
    },
    /// Print the record stored under a key
    Get {
        #[arg(long)]
        topic: String,
        #[command(flatten)]
        key: KeyArgs,
    },
    /// Remove the record stored under a key
    Delete {
        #[arg(long)]
        topic: String,
        #[command(flatten)]
        key: KeyArgs,
    },
    /// Print every record in key order
    Scan {
        #[arg(long)]
        topic: String,
    },
    /// Write a checkpoint and start a new journal segment
    Checkpoint {
        #[arg(long)]
        topic: String,
    },
    /// Checkpoint and remove journal segments it covers
    Compact {
        #[arg(long)]
        topic: String,
    },
    /// Print statistics for every configured topic
    Stats,
}

#[derive(clap::Args, Debug)]
struct KeyArgs {
    /// Key values in key path order, taken as text
    #[arg(long = "key", required_unless_present = "like")]
    values: Vec<String>,

    /// Read `true`, `false` and integers among the --key values as booleans
    /// and integers
    #[arg(long, requires = "values")]
    typed: bool,

    /// Take the key from a sample message instead, e.g.
    /// --like '{"clientName":"alice","subId":1}'. Use this for keys that mix
    /// text and numbers.
    #[arg(long, conflicts_with = "values")]
    like: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ServerConfig::parse_file(&cli.config)
        .with_context(|| format!("Failed to load '{}'", cli.config.display()))?;
    init_tracing(config.logging.first());
    config.validate().context("Invalid configuration")?;

    match cli.command {
        Command::Check => check(&config).await,
        Command::Stats => stats(&config).await,
        Command::Put { topic, data } => {
            let table = open_topic(&config, &topic).await?;
            let sequence = table.put(data.as_bytes()).await?;
            println!("committed at sequence {}", sequence);
            table.close().await?;
            Ok(())
        }
        Command::Get { topic, key } => {
            let table = open_topic(&config, &topic).await?;
            let key = key.resolve(&table)?;
            match table.get(&key)? {
                Some(record) => print_record(&record),
                None => println!("no record for {}", key),
            }
            table.close().await?;
            Ok(())
        }
        Command::Delete { topic, key } => {
            let table = open_topic(&config, &topic).await?;
            let key = key.resolve(&table)?;
            match table.delete(&key).await? {
                Some(sequence) => println!("deleted {} at sequence {}", key, sequence),
                None => println!("no record for {}", key),
            }
            table.close().await?;
            Ok(())
        }
        Command::Scan { topic } => {
            let table = open_topic(&config, &topic).await?;
            for record in table.scan()? {
                print_record(&record);
            }
            table.close().await?;
            Ok(())
        }
        Command::Checkpoint { topic } => {
            let table = open_topic(&config, &topic).await?;
            let sequence = table.checkpoint().await?;
            println!("checkpoint written at sequence {}", sequence);
            table.close().await?;
            Ok(())
        }
        Command::Compact { topic } => {
            let table = open_topic(&config, &topic).await?;
            let removed = table.compact().await?;
            println!("removed {} journal segment(s)", removed);
            table.close().await?;
            Ok(())
        }
    }
}

fn init_tracing(target: Option<&LoggingTarget>) {
    let level = target.map_or("info", |t| t.level.as_filter_directive());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match target.map(|t| t.protocol).unwrap_or_default() {
        LogProtocol::Stdout => builder.with_writer(std::io::stdout).init(),
        LogProtocol::Stderr => builder.with_writer(std::io::stderr).init(),
    }
}

async fn open_topic(config: &ServerConfig, topic: &str) -> Result<Arc<Table>> {
    let definition = config
        .find_topic(topic)
        .ok_or_else(|| anyhow!("Topic '{}' is not configured", topic))?;
    let storage = Arc::new(config.storage_for(definition)?);
    let table = Table::open(definition.clone(), storage, config.table_options_for(definition))
        .await
        .with_context(|| format!("Failed to open topic '{}'", topic))?;
    Ok(table)
}

async fn check(config: &ServerConfig) -> Result<()> {
    let registry = TableRegistry::open(config)
        .await
        .context("Recovery failed")?;
    for stats in registry.stats().await? {
        println!(
            "{}: {} records, last sequence {}, {}",
            stats.topic, stats.records, stats.last_sequence, stats.state
        );
    }
    registry.shutdown().await?;
    Ok(())
}

async fn stats(config: &ServerConfig) -> Result<()> {
    let registry = TableRegistry::open(config).await?;
    let stats = registry.stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    registry.shutdown().await?;
    Ok(())
}

fn print_record(record: &Record) {
    println!("{} {}", record.key, String::from_utf8_lossy(record.data()));
}

impl KeyArgs {
    fn resolve(&self, table: &Table) -> Result<Key> {
        if let Some(sample) = &self.like {
            let codec = table.codec();
            let document = codec.decode(sample.as_bytes())?;
            return Ok(codec.extract_key(&document, &table.definition().keys)?);
        }

        self.literal_key(table.topic(), table.definition().keys.len())
    }

    fn literal_key(&self, topic: &str, expected: usize) -> Result<Key> {
        if self.values.len() != expected {
            bail!(
                "Topic '{}' has {} key field(s), got {} --key value(s)",
                topic,
                expected,
                self.values.len()
            );
        }
        let values = self.values.iter().map(|raw| {
            if self.typed {
                KeyValue::parse_literal(raw)
            } else {
                KeyValue::Text(raw.clone())
            }
        });
        Ok(Key::new(values.collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_args(args: &[&str]) -> KeyArgs {
        let cli = Cli::try_parse_from(
            ["sowstore", "--config", "server.json", "get", "--topic", "/amps/bookmarkStore"]
                .iter()
                .chain(args),
        )
        .unwrap();
        match cli.command {
            Command::Get { key, .. } => key,
            _ => panic!("expected get"),
        }
    }

    #[test]
    fn test_key_values_are_text_by_default() {
        let key = key_args(&["--key", "alice", "--key", "1"])
            .literal_key("/amps/bookmarkStore", 2)
            .unwrap();
        assert_eq!(key, Key::from(["alice", "1"]));
    }

    #[test]
    fn test_typed_key_values() {
        let key = key_args(&["--key", "alice", "--key", "1", "--key", "true", "--typed"])
            .literal_key("t", 3)
            .unwrap();
        assert_eq!(
            key,
            Key::new(vec!["alice".into(), KeyValue::Integer(1), KeyValue::Boolean(true)])
        );
    }

    #[test]
    fn test_key_arity_must_match_topic() {
        let args = key_args(&["--key", "alice"]);
        assert!(args.literal_key("/amps/bookmarkStore", 2).is_err());
    }

    #[test]
    fn test_like_excludes_key_values() {
        let args = key_args(&["--like", r#"{"clientName":"alice","subId":"1"}"#]);
        assert!(args.values.is_empty());
        assert!(args.like.is_some());

        let both = Cli::try_parse_from([
            "sowstore", "-c", "s.json", "get", "--topic", "t", "--key", "a", "--like", "{}",
        ]);
        assert!(both.is_err());
        let neither = Cli::try_parse_from(["sowstore", "-c", "s.json", "get", "--topic", "t"]);
        assert!(neither.is_err());
    }
}
