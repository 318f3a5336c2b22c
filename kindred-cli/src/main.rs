use clap::{Parser, Subcommand, ValueEnum};
use kindred::{Engine, Hooks, KindredConfig, Query, Request, Selection};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::process;

/// Kindred CLI: query and mutate related records across configured stores
#[derive(Parser)]
#[command(name = "kindred", version, about)]
struct Cli {
    /// Path to the engine configuration
    #[arg(long, default_value = "kindred.yaml")]
    config: PathBuf,

    /// Seed file ({ "Model": [ {..}, .. ] }) created before the command runs
    #[arg(long)]
    seed: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "json")]
    format: OutputFormat,

    /// Log debug output (overridden by RUST_LOG)
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Json,
    Yaml,
}

#[derive(Subcommand)]
enum Command {
    /// Get a single document by id
    Get {
        model: String,
        id: String,
        /// Selection as JSON (e.g. '{"author": {"name": true}}')
        #[arg(long)]
        select: Option<String>,
    },

    /// Find documents
    Find {
        model: String,
        /// Query as JSON: { select, where, sort, limit, first, after, last, before }
        #[arg(long)]
        query: Option<String>,
    },

    /// Count documents
    Count {
        model: String,
        /// Where clause as JSON
        #[arg(long = "where")]
        where_: Option<String>,
    },

    /// Create a document
    Create {
        model: String,
        /// Document as JSON
        #[arg(long)]
        data: Option<String>,
        /// Field values (e.g. --field name=Richard)
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
    },

    /// Update a document
    Update {
        model: String,
        id: String,
        /// Patch as JSON
        #[arg(long)]
        data: Option<String>,
        /// Field values to update (e.g. --field age=42)
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
    },

    /// Delete a document, applying onDelete policies
    Delete { model: String, id: String },

    /// List models and their fields
    Models,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid key=value pair: no '=' found in '{s}'"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = KindredConfig::load(&cli.config)?;
    let engine = Engine::from_config(&config, Hooks::new()).await?;
    let request = engine.request();

    if let Some(seed) = &cli.seed {
        let created = seed_from_file(&request, seed).await?;
        log::info!("seeded {created} document(s) from {}", seed.display());
    }

    let output = match cli.command {
        Command::Get { model, id, select } => {
            let selection = match select {
                Some(raw) => Selection::from_json(&serde_json::from_str(&raw)?)?,
                None => Selection::new(),
            };
            let doc = request
                .get(&model, &Value::String(id), true, &selection)
                .await?;
            doc.map(|d| d.to_json()).unwrap_or(Value::Null)
        }

        Command::Find { model, query } => {
            let query = match query {
                Some(raw) => Query::from_json(&serde_json::from_str(&raw)?)?,
                None => Query::new(),
            };
            let docs = request.find(&model, &query).await?;
            Value::Array(docs.iter().map(|d| d.to_json()).collect())
        }

        Command::Count { model, where_ } => {
            let where_ = match where_ {
                Some(raw) => json_object(&raw)?,
                None => Map::new(),
            };
            let count = request.count(&model, &where_).await?;
            serde_json::json!({ "model": model, "count": count })
        }

        Command::Create {
            model,
            data,
            fields,
        } => {
            let data = input_document(data.as_deref(), &fields)?;
            request
                .create(&model, data, &Selection::new())
                .await?
                .to_json()
        }

        Command::Update {
            model,
            id,
            data,
            fields,
        } => {
            let patch = input_document(data.as_deref(), &fields)?;
            request
                .update(&model, &Value::String(id), patch, &Selection::new())
                .await?
                .to_json()
        }

        Command::Delete { model, id } => {
            let deleted = request
                .delete(&model, &Value::String(id), &Selection::new())
                .await?;
            serde_json::json!({ "ok": true, "deleted": deleted.to_json() })
        }

        Command::Models => {
            let models: Vec<Value> = engine
                .registry()
                .public_models()
                .map(|model| {
                    let fields: Vec<Value> = model
                        .fields
                        .iter()
                        .map(|f| {
                            serde_json::json!({
                                "name": f.name,
                                "type": format!("{:?}", f.field_type),
                                "required": f.required,
                                "virtual": f.is_virtual(),
                                "embedded": f.embedded,
                            })
                        })
                        .collect();
                    serde_json::json!({ "name": model.name, "store": model.store, "fields": fields })
                })
                .collect();
            Value::Array(models)
        }
    };

    print_output(&output, &cli.format)
}

/// Create every seed document through the orchestrator, in file order.
async fn seed_from_file(request: &Request, path: &Path) -> Result<usize, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read seed file '{}': {e}", path.display()))?;
    // YAML mappings keep their key order; JSON is valid YAML.
    let seed: serde_yaml::Mapping = serde_yaml::from_str(&content)?;
    let mut created = 0;
    for (model, docs) in seed {
        let model = model
            .as_str()
            .ok_or("Seed file keys must be model names")?
            .to_string();
        let docs: Vec<Map<String, Value>> = serde_yaml::from_value(docs)?;
        for doc in docs {
            request.create(&model, doc, &Selection::new()).await?;
            created += 1;
        }
    }
    Ok(created)
}

fn json_object(raw: &str) -> Result<Map<String, Value>, Box<dyn std::error::Error>> {
    match serde_json::from_str(raw)? {
        Value::Object(map) => Ok(map),
        other => Err(format!("Expected a JSON object, got {other}").into()),
    }
}

fn input_document(
    data: Option<&str>,
    fields: &[(String, String)],
) -> Result<Map<String, Value>, Box<dyn std::error::Error>> {
    let mut doc = match data {
        Some(raw) => json_object(raw)?,
        None => Map::new(),
    };
    for (key, val) in fields {
        // Numbers, booleans, arrays and objects parse as JSON; anything else is a string
        let json_val = serde_json::from_str(val).unwrap_or_else(|_| Value::String(val.clone()));
        doc.insert(key.clone(), json_val);
    }
    Ok(doc)
}

fn print_output(value: &Value, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_document_merges_fields_over_data() {
        let fields = vec![
            ("age".to_string(), "42".to_string()),
            ("name".to_string(), "Richard".to_string()),
        ];
        let doc = input_document(Some(r#"{"name": "Rich", "tags": ["a"]}"#), &fields).unwrap();
        assert_eq!(doc["age"], serde_json::json!(42));
        assert_eq!(doc["name"], serde_json::json!("Richard"));
        assert_eq!(doc["tags"], serde_json::json!(["a"]));
    }

    #[test]
    fn test_parse_key_value_requires_equals() {
        assert!(parse_key_value("name").is_err());
        assert_eq!(
            parse_key_value("a=b=c").unwrap(),
            ("a".to_string(), "b=c".to_string())
        );
    }

    #[tokio::test]
    async fn test_seed_creates_in_file_order() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        std::fs::write(
            dir.join("schema.yaml"),
            "models:\n  Person:\n    fields:\n      name: String\n  Book:\n    fields:\n      author: { type: Person, required: true }\n",
        )
        .unwrap();
        std::fs::write(dir.join("kindred.yaml"), "schema: schema.yaml\n").unwrap();
        std::fs::write(
            dir.join("seed.json"),
            r#"{ "Person": [{ "id": "richard", "name": "Richard" }], "Book": [{ "author": "richard" }] }"#,
        )
        .unwrap();

        let config = KindredConfig::load(&dir.join("kindred.yaml")).unwrap();
        let engine = Engine::from_config(&config, Hooks::new()).await.unwrap();
        let request = engine.request();
        let created = seed_from_file(&request, &dir.join("seed.json")).await.unwrap();
        assert_eq!(created, 2);
        assert_eq!(request.count("Book", &Map::new()).await.unwrap(), 1);
    }
}
