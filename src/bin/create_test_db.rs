use std::path::Path;

use roaming_hub::adapters::db::{open_connection, run_migrations, schema_version, upsert_document};
use roaming_hub::domain::models::RoamingEndpoint;

const DEFAULT_TENANT: &str = "default";

struct Args {
    path: String,
    force: bool,
    tenant_id: String,
    endpoint_files: Vec<String>,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("failed to create test db: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let Some(args) = parse_args(std::env::args().skip(1).collect())? else {
        print_help();
        return Ok(());
    };

    let path = Path::new(&args.path);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .map_err(|error| format!("failed to create parent directory: {error}"))?;
    }
    if args.force && path.exists() {
        std::fs::remove_file(path)
            .map_err(|error| format!("failed to remove existing db file: {error}"))?;
    }

    let mut connection = open_connection(&args.path).map_err(|error| error.to_string())?;
    run_migrations(&mut connection).map_err(|error| error.to_string())?;

    for file in &args.endpoint_files {
        let content = std::fs::read_to_string(file)
            .map_err(|error| format!("failed to read {file}: {error}"))?;
        let endpoint: RoamingEndpoint = serde_json::from_str(&content)
            .map_err(|error| format!("{file} is not a roaming endpoint: {error}"))?;
        upsert_document(&connection, &args.tenant_id, &endpoint, chrono::Utc::now())
            .map_err(|error| error.to_string())?;
        println!(
            "seeded {} endpoint {} for tenant {}",
            endpoint.role.as_str(),
            endpoint.id,
            args.tenant_id
        );
    }

    let version = schema_version(&connection).map_err(|error| error.to_string())?;
    println!("created/updated roaming db at: {}", args.path);
    println!("schema version: {version}");
    Ok(())
}

fn parse_args(raw: Vec<String>) -> Result<Option<Args>, String> {
    let mut args = Args {
        path: Path::new("data")
            .join("roaming_test.db")
            .to_string_lossy()
            .into_owned(),
        force: false,
        tenant_id: DEFAULT_TENANT.to_string(),
        endpoint_files: Vec::new(),
    };

    let mut raw = raw.into_iter();
    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "--path" => args.path = value_of(&mut raw, "--path")?,
            "--tenant" => args.tenant_id = value_of(&mut raw, "--tenant")?,
            "--endpoint" => args.endpoint_files.push(value_of(&mut raw, "--endpoint")?),
            "--force" => args.force = true,
            "--help" | "-h" => return Ok(None),
            other => return Err(format!("unknown argument: {other}")),
        }
    }

    Ok(Some(args))
}

fn value_of(raw: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, String> {
    raw.next()
        .filter(|value| !value.starts_with("--"))
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn print_help() {
    println!("create_test_db");
    println!();
    println!("Usage:");
    println!(
        "  cargo run --bin create_test_db -- [--path <file>] [--force] [--tenant <id>] [--endpoint <json>]..."
    );
    println!();
    println!("Options:");
    println!("  --path <file>      target sqlite file (default: data/roaming_test.db)");
    println!("  --force            delete existing file before creating");
    println!("  --tenant <id>      tenant the seeded endpoints belong to (default: {DEFAULT_TENANT})");
    println!("  --endpoint <json>  roaming endpoint document to seed, repeatable");
}
