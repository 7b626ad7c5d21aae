use clap::{Parser, Subcommand, ValueEnum};
use docmap::mapper::{FindOptions, InsertOptions, RandomOptions, UpdateOptions};
use docmap::pipeline::parse_sort;
use docmap::schema::parse_schema;
use docmap::{DocumentStore, Mapper, PipelineOptions, SqliteStore};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::process;

const SCHEMA_FILE: &str = "schema.yaml";
const DATABASE_FILE: &str = "_docmap.db";

/// docmap CLI: run schema-checked document operations against a data directory
#[derive(Parser)]
#[command(name = "docmap", version, about)]
struct Cli {
    /// Directory holding schema.yaml and the database (default: current directory)
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    /// Secret mixed into hashes of encrypted fields
    #[arg(long)]
    hash_secret: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Insert a new document
    Insert {
        /// Entity name
        entity: String,
        /// Field values (e.g. --field name="Alice Chen")
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
        /// Skip created_at/updated_at
        #[arg(long)]
        no_timestamps: bool,
    },

    /// Find documents matching a query
    Find {
        /// Entity name
        entity: String,
        /// Query as JSON, or a document id
        #[arg(long)]
        query: Option<String>,
        /// Sort as JSON (e.g. '{"name": "asc"}')
        #[arg(long)]
        sort: Option<String>,
        #[arg(long)]
        skip: Option<u64>,
        #[arg(long)]
        limit: Option<u64>,
    },

    /// Count documents matching a query
    Count {
        /// Entity name
        entity: String,
        /// Query as JSON, or a document id
        #[arg(long)]
        query: Option<String>,
    },

    /// Update matching documents
    Update {
        /// Entity name
        entity: String,
        /// Query as JSON, or a document id
        #[arg(long)]
        query: String,
        /// Field values to set (e.g. --set status=published)
        #[arg(long = "set", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
        /// Insert from the query when nothing matches
        #[arg(long)]
        upsert: bool,
        /// Update every match instead of the first
        #[arg(long)]
        many: bool,
    },

    /// Delete matching documents, cascading to dependents
    Delete {
        /// Entity name
        entity: String,
        /// Query as JSON, or a document id
        #[arg(long)]
        query: String,
        /// Delete every match instead of the first
        #[arg(long)]
        many: bool,
        /// Show what would be deleted without actually deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Run a pipeline spec (filter, join, postFilter, group, sort)
    Aggregate {
        /// Entity name
        entity: String,
        /// Pipeline specs or a plain query, as JSON
        #[arg(long)]
        specs: String,
    },

    /// Generate a random document
    Random {
        /// Entity name
        entity: String,
        /// Fixed field values (e.g. --field email=a@b.c)
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
        /// Generate optional fields too
        #[arg(long)]
        include_optionals: bool,
        /// Insert the generated document
        #[arg(long)]
        insert: bool,
    },

    /// Show entities and collection sizes
    Status,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid key=value pair: no '=' found in '{s}'"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        log::error!("command failed: {e}");
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn open(cli: &Cli) -> Result<Mapper<SqliteStore>, Box<dyn std::error::Error>> {
    let schema_path = cli.data_dir.join(SCHEMA_FILE);
    log::debug!("loading schema from {}", schema_path.display());
    let mut definition = parse_schema(&schema_path)?;
    definition.settings = definition.settings.clone().apply_env();
    if let Some(secret) = &cli.hash_secret {
        definition.settings = definition.settings.clone().with_hash_secret(secret.clone());
    }
    let database_path = cli.data_dir.join(DATABASE_FILE);
    log::info!("opening store at {}", database_path.display());
    let store = SqliteStore::open(&database_path)?;
    let mapper = Mapper::from_definition(store, definition)?;
    log::debug!("{} entities registered", mapper.registry().len());
    Ok(mapper)
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mapper = open(&cli)?;

    let output = match &cli.command {
        Command::Insert {
            entity,
            fields,
            no_timestamps,
        } => {
            let options = InsertOptions {
                timestamps: !no_timestamps,
            };
            let doc = mapper.model(entity)?.insert_one(fields_to_value(fields), options)?;
            Value::Object(doc)
        }

        Command::Find {
            entity,
            query,
            sort,
            skip,
            limit,
        } => {
            let sort = match sort {
                Some(sort) => Some(parse_sort(&serde_json::from_str(sort)?)?),
                None => None,
            };
            let options = FindOptions {
                sort,
                skip: *skip,
                limit: *limit,
            };
            let docs = mapper.model(entity)?.find_many(&parse_query(query.as_deref()), options)?;
            documents(docs)
        }

        Command::Count { entity, query } => {
            let count = mapper.model(entity)?.count(&parse_query(query.as_deref()))?;
            json!({ "count": count })
        }

        Command::Update {
            entity,
            query,
            fields,
            upsert,
            many,
        } => {
            let model = mapper.model(entity)?;
            let query = parse_query(Some(query.as_str()));
            let update = json!({ "$set": fields_to_value(fields) });
            let options = UpdateOptions {
                upsert: *upsert,
                ..Default::default()
            };
            if *many {
                json!({ "ok": true, "updated": model.update_many(query, update, options)? })
            } else {
                json!({ "ok": true, "updated": model.update_one(query, update, options)? })
            }
        }

        Command::Delete {
            entity,
            query,
            many,
            dry_run,
        } => {
            let model = mapper.model(entity)?;
            let query = parse_query(Some(query.as_str()));
            if *dry_run {
                let options = FindOptions {
                    limit: if *many { None } else { Some(1) },
                    ..Default::default()
                };
                let docs = model.find_many(&query, options)?;
                json!({ "dry_run": true, "would_delete": documents(docs) })
            } else if *many {
                json!({ "ok": true, "deleted": model.delete_many(query)? })
            } else {
                json!({ "ok": true, "deleted": model.delete_one(query)? })
            }
        }

        Command::Aggregate { entity, specs } => {
            let specs: Value = serde_json::from_str(specs)?;
            let docs = mapper.model(entity)?.aggregate(&specs, &PipelineOptions::default())?;
            documents(docs)
        }

        Command::Random {
            entity,
            fields,
            include_optionals,
            insert,
        } => {
            let model = mapper.model(entity)?;
            let options = RandomOptions {
                include_optionals: *include_optionals,
            };
            let doc = model.random_fields(&fields_to_value(fields), options)?;
            if *insert {
                Value::Object(model.insert_one(Value::Object(doc), InsertOptions::default())?)
            } else {
                Value::Object(doc)
            }
        }

        Command::Status => status(&mapper, &cli.data_dir)?,
    };

    print_output(&output, &cli.format)?;
    mapper.close()?;
    log::debug!("store closed");
    Ok(())
}

fn status(mapper: &Mapper<SqliteStore>, data_dir: &Path) -> Result<Value, Box<dyn std::error::Error>> {
    let counts: Map<String, Value> = mapper
        .store()
        .collection_counts()?
        .into_iter()
        .map(|(collection, count)| (collection, Value::from(count)))
        .collect();
    let entities: Vec<Value> = mapper
        .registry()
        .iter()
        .map(|schema| {
            json!({
                "name": schema.name,
                "collection": schema.collection,
                "fields": schema.fields.len(),
                "documents": counts.get(&schema.collection).cloned().unwrap_or(Value::from(0)),
            })
        })
        .collect();
    Ok(json!({
        "data_dir": data_dir.display().to_string(),
        "ready": mapper.store().is_ready(),
        "entities": entities,
    }))
}

/// Queries are JSON; anything that does not parse is taken as a document id.
fn parse_query(query: Option<&str>) -> Value {
    match query {
        None => Value::Null,
        Some(text) => serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())),
    }
}

fn documents(docs: Vec<Map<String, Value>>) -> Value {
    Value::Array(docs.into_iter().map(Value::Object).collect())
}

fn print_output(value: &Value, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

fn fields_to_value(fields: &[(String, String)]) -> Value {
    let mut map = Map::new();
    for (key, val) in fields {
        // numbers, booleans, arrays and objects parse as JSON; the rest stays a string
        let json_val = serde_json::from_str(val).unwrap_or_else(|_| Value::String(val.clone()));
        map.insert(key.clone(), json_val);
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cli_for(dir: &Path, args: &[&str]) -> Cli {
        let data_dir = dir.display().to_string();
        let mut argv = vec!["docmap", "--data-dir", data_dir.as_str()];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_open_data_dir() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(SCHEMA_FILE),
            "entities:\n  users:\n    fields:\n      name: { type: string, required: true }\n",
        )
        .unwrap();

        let cli = cli_for(tmp.path(), &["--hash-secret", "s3cret", "status"]);
        let mapper = open(&cli).unwrap();
        assert_eq!(mapper.settings().hash_secret, "s3cret");
        assert!(mapper.registry().contains("users"));
        assert!(tmp.path().join(DATABASE_FILE).exists());
        mapper.close().unwrap();
    }

    #[test]
    fn test_open_without_schema_fails() {
        let tmp = TempDir::new().unwrap();
        let cli = cli_for(tmp.path(), &["status"]);
        assert!(open(&cli).is_err());
    }

    #[test]
    fn test_argument_parsing() {
        assert_eq!(
            parse_key_value("name=Alice=B").unwrap(),
            ("name".to_string(), "Alice=B".to_string())
        );
        assert!(parse_key_value("name").is_err());
        assert_eq!(parse_query(None), Value::Null);
        assert_eq!(parse_query(Some(r#"{"n": 1}"#)), json!({ "n": 1 }));
        assert_eq!(parse_query(Some("01hzy")), json!("01hzy"));
        assert_eq!(
            fields_to_value(&[("n".into(), "3".into()), ("s".into(), "x".into())]),
            json!({ "n": 3, "s": "x" })
        );
    }
}
