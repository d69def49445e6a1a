//! Interactive shell for a simpledoc database file.
//!
//! ```bash
//! # open (or create) a database and start the REPL
//! simpledoc app.db
//!
//! # run one command and exit
//! simpledoc app.db -c 'find people {"age": {"$gte": 30}}'
//! ```

use std::{
    error::Error,
    io::{self, BufRead, Write},
    path::PathBuf,
    process::ExitCode,
};

use clap::Parser;
use serde_json::Value as Json;
use simpledoc::{
    bson::json, query::Filter, Config, Database, DbError, Document, SyncMode, Transaction, Value,
};
use tracing_subscriber::EnvFilter;

type CliResult<T> = Result<T, Box<dyn Error>>;

/// simpledoc command-line shell
#[derive(Parser, Debug)]
#[command(name = "simpledoc", version, about = "Shell for simpledoc database files")]
struct Args {
    /// Database file, created if missing
    #[arg(default_value = "simpledoc.db")]
    path: PathBuf,

    /// Page size for a new file
    #[arg(long, default_value_t = simpledoc::config::DEFAULT_PAGE_SIZE)]
    page_size: usize,

    /// Page cache capacity, in pages
    #[arg(long, default_value_t = simpledoc::config::DEFAULT_CACHE_SIZE)]
    cache_size: usize,

    /// Skip fsync on commit
    #[arg(long)]
    no_sync: bool,

    /// Execute a single command and exit
    #[arg(short = 'c', long)]
    command: Option<String>,

    /// Enable debug logging
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("simpledoc=debug")
        } else {
            EnvFilter::new("simpledoc=warn")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> CliResult<()> {
    let config = Config::new()
        .page_size(args.page_size)
        .cache_size(args.cache_size)
        .sync(if args.no_sync { SyncMode::Off } else { SyncMode::Full });
    let db = Database::open(&args.path, config)?;
    let mut session = Session { db, txn: None };

    if let Some(command) = &args.command {
        let output = session.execute(command)?;
        if !output.is_empty() {
            println!("{output}");
        }
        return Ok(());
    }

    println!("simpledoc {} ({})", env!("CARGO_PKG_VERSION"), args.path.display());
    println!("Type 'help' for commands, 'quit' to exit");
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        let prompt = if session.txn.is_some() { "simpledoc*> " } else { "simpledoc> " };
        print!("{prompt}");
        io::stdout().flush()?;

        let Some(line) = lines.next() else {
            break;
        };
        let line = line?;
        let input = line.trim();
        match input {
            "" => continue,
            "quit" | "exit" => break,
            _ => match session.execute(input) {
                Ok(output) if output.is_empty() => {}
                Ok(output) => println!("{output}"),
                Err(e) => println!("Error: {e}"),
            },
        }
    }

    if let Some(txn) = session.txn.take() {
        println!("Rolling back open transaction");
        txn.rollback()?;
    }
    session.db.close()?;
    Ok(())
}

/// The open database plus the transaction started with `begin`, if any.
struct Session {
    db: Database,
    txn: Option<Transaction>,
}

/// Split off the first whitespace-delimited word.
fn next_word(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.find(char::is_whitespace) {
        Some(at) => (&input[..at], input[at..].trim_start()),
        None => (input, ""),
    }
}

/// Parse zero or more JSON objects written back to back.
fn parse_documents(input: &str) -> CliResult<Vec<Document>> {
    serde_json::Deserializer::from_str(input)
        .into_iter::<Json>()
        .map(|value| -> CliResult<Document> { Ok(json::from_json(&value?)?) })
        .collect()
}

fn exactly<const N: usize>(input: &str, usage: &str) -> CliResult<[Document; N]> {
    let docs = parse_documents(input)?;
    <[Document; N]>::try_from(docs).map_err(|_| format!("usage: {usage}").into())
}

fn filter_arg(input: &str, usage: &str) -> CliResult<Document> {
    if input.is_empty() {
        return Ok(Document::new());
    }
    let [filter] = exactly::<1>(input, usage)?;
    Ok(filter)
}

fn render(doc: &Document) -> String {
    json::to_json(doc).to_string()
}

fn render_id(id: &Value) -> String {
    json::value_to_json(id).to_string()
}

impl Session {
    fn execute(&mut self, input: &str) -> CliResult<String> {
        let (command, rest) = next_word(input);
        match command.to_lowercase().as_str() {
            "help" => Ok(HELP.trim_end().to_string()),
            "begin" => self.begin(),
            "commit" => self.finish(true),
            "rollback" => self.finish(false),
            "show" => match next_word(rest) {
                ("collections", "") => self.show_collections(),
                _ => Err("usage: show collections".into()),
            },
            "stats" => self.stats(),
            "check" => self.check(),
            "describe" => self.describe(rest),
            "insert" => self.insert(rest),
            "find" => self.find(rest),
            "explain" => self.explain(rest),
            "update" => self.update(rest),
            "delete" => self.delete(rest),
            "create" => match next_word(rest) {
                ("index", args) => self.create_index(args),
                _ => Err("usage: create index <collection> <field> [unique]".into()),
            },
            "drop" => match next_word(rest) {
                ("index", args) => self.drop_index(args),
                ("collection", name) if !name.is_empty() => self.drop_collection(name),
                _ => Err("usage: drop index <collection> <field> | drop collection <name>".into()),
            },
            other => Err(format!("unknown command {other:?}; type 'help'").into()),
        }
    }

    fn begin(&mut self) -> CliResult<String> {
        if self.txn.is_some() {
            return Err("a transaction is already open".into());
        }
        self.txn = Some(self.db.begin_transaction()?);
        Ok("BEGIN".into())
    }

    fn finish(&mut self, commit: bool) -> CliResult<String> {
        let txn = self.txn.take().ok_or("no open transaction")?;
        if commit {
            txn.commit()?;
            Ok("COMMIT".into())
        } else {
            txn.rollback()?;
            Ok("ROLLBACK".into())
        }
    }

    fn show_collections(&self) -> CliResult<String> {
        let names = match &self.txn {
            Some(txn) => txn.list_collection_names()?,
            None => self.db.list_collection_names()?,
        };
        Ok(names.join("\n"))
    }

    fn stats(&self) -> CliResult<String> {
        let stats = self.db.stats()?;
        Ok(format!(
            "page size:    {}\n\
             pages:        {} ({} free)\n\
             file size:    {} bytes\n\
             journal size: {} bytes\n\
             collections:  {}\n\
             last lsn:     {}\n\
             cache:        {}/{} pages, {} hits, {} misses\n\
             writer:       {}",
            stats.page_size,
            stats.page_count,
            stats.free_pages,
            stats.file_len,
            stats.journal_len,
            stats.collections,
            stats.last_lsn,
            stats.cached_pages,
            stats.cache_capacity,
            stats.cache_hits,
            stats.cache_misses,
            if stats.transaction_active { "active" } else { "idle" },
        ))
    }

    fn check(&self) -> CliResult<String> {
        let report = self.db.check()?;
        let mut lines = vec![format!(
            "ok: {} pages, {} free, catalog height {}",
            report.page_count, report.free_pages, report.catalog.height
        )];
        for collection in &report.collections {
            lines.push(format!(
                "  {}: {} documents, {} pages",
                collection.name,
                collection.documents,
                collection.primary.total_pages()
            ));
        }
        Ok(lines.join("\n"))
    }

    fn describe(&self, name: &str) -> CliResult<String> {
        if name.is_empty() {
            return Err("usage: describe <collection>".into());
        }
        let report = self.db.check()?;
        let collection = report
            .collections
            .iter()
            .find(|collection| collection.name == name)
            .ok_or_else(|| DbError::NotFound(format!("collection {name}")))?;
        let indexes = self.db.collection(name).list_indexes()?;
        let mut lines = vec![
            format!("collection {name}"),
            format!("  documents: {}", collection.documents),
            format!(
                "  primary:   height {}, {} leaf, {} internal, {} overflow pages",
                collection.primary.height,
                collection.primary.leaf_pages,
                collection.primary.internal_pages,
                collection.primary.overflow_pages
            ),
        ];
        for (index, (_, stats)) in indexes.iter().zip(&collection.indexes) {
            lines.push(format!(
                "  index {}{}: height {}, {} pages",
                index.field,
                if index.unique { " (unique)" } else { "" },
                stats.height,
                stats.total_pages()
            ));
        }
        Ok(lines.join("\n"))
    }

    fn insert(&mut self, args: &str) -> CliResult<String> {
        let usage = "insert <collection> <json> [<json> ...]";
        let (name, rest) = next_word(args);
        let docs = parse_documents(rest)?;
        if name.is_empty() || docs.is_empty() {
            return Err(format!("usage: {usage}").into());
        }
        let ids = match &mut self.txn {
            Some(txn) => txn.collection(name).insert_many(docs)?,
            None => self.db.collection(name).insert_many(docs)?,
        };
        Ok(ids.iter().map(render_id).collect::<Vec<_>>().join("\n"))
    }

    fn find(&mut self, args: &str) -> CliResult<String> {
        let (name, rest) = next_word(args);
        let filter = filter_arg(rest, "find <collection> [filter]")?;
        let docs = match &mut self.txn {
            Some(txn) => txn
                .collection(name)
                .find(filter)?
                .collect::<Result<Vec<_>, _>>()?,
            None => self
                .db
                .collection(name)
                .find(filter)?
                .collect::<Result<Vec<_>, _>>()?,
        };
        let mut lines: Vec<String> = docs.iter().map(render).collect();
        lines.push(format!("({} documents)", docs.len()));
        Ok(lines.join("\n"))
    }

    fn explain(&self, args: &str) -> CliResult<String> {
        let (name, rest) = next_word(args);
        let filter = filter_arg(rest, "explain <collection> [filter]")?;
        let predicates = Filter::parse(&filter)?
            .predicates()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        let plan = self.db.collection(name).explain(filter)?;
        if predicates.is_empty() {
            return Ok(format!("plan:   {plan}"));
        }
        Ok(format!("plan:   {plan}\nfilter: {}", predicates.join(" and ")))
    }

    fn update(&mut self, args: &str) -> CliResult<String> {
        let (name, rest) = next_word(args);
        let [filter, update] = exactly::<2>(rest, "update <collection> <filter> <update>")?;
        let result = match &mut self.txn {
            Some(txn) => txn.collection(name).update_many(filter, update)?,
            None => self.db.collection(name).update_many(filter, update)?,
        };
        Ok(format!("matched {}, modified {}", result.matched, result.modified))
    }

    fn delete(&mut self, args: &str) -> CliResult<String> {
        let (name, rest) = next_word(args);
        let [filter] = exactly::<1>(rest, "delete <collection> <filter>")?;
        let deleted = match &mut self.txn {
            Some(txn) => txn.collection(name).delete_many(filter)?,
            None => self.db.collection(name).delete_many(filter)?,
        };
        Ok(format!("deleted {deleted}"))
    }

    fn create_index(&mut self, args: &str) -> CliResult<String> {
        let (name, rest) = next_word(args);
        let (field, option) = next_word(rest);
        let unique = match option {
            "" => false,
            "unique" => true,
            _ => return Err("usage: create index <collection> <field> [unique]".into()),
        };
        match (&mut self.txn, unique) {
            (Some(txn), false) => txn.collection(name).create_index(field)?,
            (Some(txn), true) => txn.collection(name).create_unique_index(field)?,
            (None, false) => self.db.collection(name).create_index(field)?,
            (None, true) => self.db.collection(name).create_unique_index(field)?,
        }
        Ok(format!("created index on {name}.{field}"))
    }

    fn drop_index(&mut self, args: &str) -> CliResult<String> {
        let (name, field) = next_word(args);
        match &mut self.txn {
            Some(txn) => txn.collection(name).drop_index(field)?,
            None => self.db.collection(name).drop_index(field)?,
        }
        Ok(format!("dropped index on {name}.{field}"))
    }

    fn drop_collection(&mut self, name: &str) -> CliResult<String> {
        match &mut self.txn {
            Some(txn) => txn.drop_collection(name)?,
            None => self.db.drop_collection(name)?,
        }
        Ok(format!("dropped collection {name}"))
    }
}

const HELP: &str = r#"
Commands:
  help                                     Show this help message
  quit | exit                              Leave the shell
  show collections                         List collections
  describe <col>                           Document count, tree shape and indexes
  stats                                    File, page and cache counters
  check                                    Verify every tree and the free list
  insert <col> <json> [<json> ...]         Insert documents
  find <col> [filter]                      Print matching documents
  explain <col> [filter]                   Show the access path for a filter
  update <col> <filter> <update>           Apply $set/$unset/$inc/$mul/$min/$max/$rename
  delete <col> <filter>                    Delete matching documents
  create index <col> <field> [unique]      Create a secondary index
  drop index <col> <field>                 Remove a secondary index
  drop collection <col>                    Remove a collection and its indexes
  begin | commit | rollback                Group commands into one transaction

Example:
  insert people {"name": "Ada", "age": 36} {"name": "Alan", "age": 41}
  create index people age
  find people {"age": {"$gte": 40}}
  update people {"name": "Ada"} {"$inc": {"age": 1}}
"#;
