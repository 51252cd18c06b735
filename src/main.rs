mod cfg;
mod engine;
mod error;
mod filter;
mod hierarchy;
mod ir;
mod opcodes;
mod policy;
mod scan;
mod signature;
mod trace;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{Level, debug, info, warn};

use crate::cfg::{CompileOptions, GraphTable, compile, compile_all};
use crate::engine::{RenderedNgram, SearchOptions};
use crate::filter::{ClassPatterns, MethodTable};
use crate::hierarchy::{ClassHierarchy, ClassTable};
use crate::ir::{MethodBody, MethodKey};
use crate::policy::undigged::CommonObjectMethods;
use crate::policy::untracked::LibraryHelperCalls;
use crate::policy::{DigPolicy, UntrackedCallPolicy};
use crate::scan::scan_inputs;

/// Signatures defined at least this many times are listed by `--mode diagnostic`.
const WIDELY_DEFINED: usize = 50;

/// CLI arguments for callgram execution.
#[derive(Parser, Debug)]
#[command(
    name = "callgram",
    about = "Interprocedural call-sequence n-grams over JVM method bodies.",
    version
)]
struct Cli {
    #[command(subcommand)]
    action: Action,
    #[arg(long, global = true)]
    verbose: bool,
    #[arg(long, global = true)]
    quiet: bool,
    #[arg(long, global = true)]
    timing: bool,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Print the call n-grams of every selected method.
    Ngram(NgramArgs),
    /// Expand a call-label sequence into its concrete traces.
    Trace(TraceArgs),
}

/// Options shared by every subcommand that compiles the program.
#[derive(Args, Debug, Clone)]
struct ProgramArgs {
    #[arg(long, value_name = "PATH")]
    input: PathBuf,
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    #[arg(short = 'n', long, default_value_t = 6, allow_negative_numbers = true)]
    ngram_size: i64,
    #[arg(long, default_value_t = -2, allow_negative_numbers = true)]
    max_call_depth: i64,
    /// Drop signatures defined in more classes than this (-1: no limit).
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    max_method_definition: i64,
    #[arg(long)]
    allow_repetitive_ngram: bool,
    #[arg(long)]
    no_branch_ngram: bool,
    /// Exclude a class, or a package with `pkg/*`.
    #[arg(short = 'e', long, value_name = "PATTERN")]
    exclude: Vec<String>,
    /// Compile without the class hierarchy and skip expanding common object methods.
    #[arg(long)]
    no_dispatch_optimization: bool,
    #[arg(long)]
    no_returning_execution_path: bool,
    #[arg(long)]
    count_branch_in_surface_level: bool,
}

impl ProgramArgs {
    fn search_options(&self, ngram_size: usize) -> SearchOptions {
        SearchOptions {
            ngram_size,
            max_call_depth: self.max_call_depth,
            allow_repetitive_ngram: self.allow_repetitive_ngram,
            no_branch_ngram: self.no_branch_ngram,
            no_returning_execution_path: self.no_returning_execution_path,
            use_undigged_methods: self.no_dispatch_optimization,
            count_branch_in_surface_level: self.count_branch_in_surface_level,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct NgramArgs {
    #[command(flatten)]
    program: ProgramArgs,
    /// Only start from methods of matching classes.
    #[arg(long, value_name = "PATTERN")]
    entry: Vec<String>,
    #[arg(long)]
    include_ctors: bool,
    #[arg(long, value_enum, default_value_t = Mode::Ngrams)]
    mode: Mode,
    #[arg(long, value_enum, default_value_t = Format::Text)]
    format: Format,
}

#[derive(Args, Debug, Clone)]
struct TraceArgs {
    #[command(flatten)]
    program: ProgramArgs,
    #[arg(long = "seq", value_name = "LABEL", num_args = 1.., required = true)]
    sequence: Vec<String>,
    /// Start location `class.method,index`; every method when omitted.
    #[arg(long = "loc", value_name = "LOCATION", num_args = 1..)]
    locations: Vec<String>,
    /// Print the number of locations shared by every trace.
    #[arg(short = 'c', long)]
    metric_clat: bool,
    /// Print the deepest call depth among the traces.
    #[arg(short = 'd', long)]
    metric_max_depth: bool,
    /// Print the number of distinct callees in the sequence.
    #[arg(short = 'u', long)]
    metric_unique_method: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum Mode {
    Ngrams,
    Diagnostic,
    Signatures,
    MethodBody,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum Format {
    Text,
    Json,
}

/// N-grams of one starting method, as written by `--format json`.
#[derive(Debug, Serialize)]
struct MethodNgrams {
    class: String,
    method: String,
    ngrams: Vec<RenderedNgram>,
}

/// Counts reported by `--timing`.
#[derive(Debug, Default)]
struct RunSummary {
    methods: usize,
    ngrams: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);
    run(cli)
}

fn init_logging(verbose: bool, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else if verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(io::stderr)
        .with_ansi(false)
        .without_time()
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let started_at = Instant::now();
    let summary = match &cli.action {
        Action::Ngram(args) => run_ngram(args)?,
        Action::Trace(args) => run_trace(args)?,
    };

    if cli.timing && !cli.quiet {
        eprintln!(
            "timing: total_ms={} methods={} ngrams={}",
            started_at.elapsed().as_millis(),
            summary.methods,
            summary.ngrams
        );
    }

    Ok(())
}

fn run_ngram(args: &NgramArgs) -> Result<RunSummary> {
    let program = &args.program;
    let ngram_size = usize::try_from(program.ngram_size)
        .ok()
        .filter(|size| *size > 0)
        .ok_or(error::Error::InvalidNgramSize(program.ngram_size))?;
    let scan = load(&program.input)?;
    let mut writer = output_writer(program.output.as_deref())?;

    if args.mode == Mode::Signatures {
        for key in scan.bodies.keys() {
            writeln!(writer, "{key}").context("failed to write signatures")?;
        }
        return Ok(RunSummary {
            methods: scan.bodies.len(),
            ngrams: 0,
        });
    }

    if args.mode == Mode::MethodBody {
        write_method_bodies(&mut writer, &scan.bodies)?;
        return Ok(RunSummary {
            methods: scan.bodies.len(),
            ngrams: 0,
        });
    }

    let mut table = filter::method_table(scan.bodies);
    let declared = filter::declared_methods(&table);
    filter::exclude_classes(&mut table, &ClassPatterns::new(&program.exclude));
    if !args.include_ctors {
        filter::exclude_ctors(&mut table);
    }
    remove_over_defined(&mut table, program.max_method_definition);
    let (targets, per_class) = filter::select_targets(&table, &ClassPatterns::new(&args.entry));

    if args.mode == Mode::Diagnostic {
        write_diagnostic(&mut writer, per_class.len(), targets.len(), &table)?;
        return Ok(RunSummary {
            methods: targets.len(),
            ngrams: 0,
        });
    }

    let graphs = compile_program(&table, declared, scan.deriving, program)?;
    let options = program.search_options(ngram_size);
    let dig_policy = CommonObjectMethods;

    let mut summary = RunSummary::default();
    let mut results = Vec::new();
    let mut current_class: Option<&str> = None;
    for key in &targets {
        if graphs.get(key).is_none() {
            continue;
        }
        if current_class != Some(key.class.as_str()) {
            current_class = Some(key.class.as_str());
            info!(
                class = %key.class,
                methods = per_class.get(&key.class).copied().unwrap_or_default(),
                "generating n-grams"
            );
        }
        let found = match engine::generate(&graphs, key, &options, &dig_policy) {
            Ok(found) => found,
            Err(err) if err.is_configuration() => {
                warn!(method = %key, "{err}");
                continue;
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to generate n-grams for {key}"));
            }
        };
        debug!(method = %key, ngrams = found.len(), "generated n-grams");
        let ngrams: Vec<RenderedNgram> = found.render().into_iter().flatten().collect();
        summary.methods += 1;
        summary.ngrams += ngrams.len();
        results.push(MethodNgrams {
            class: key.class.clone(),
            method: key.method.clone(),
            ngrams,
        });
    }

    match args.format {
        Format::Text => {
            for line in header_lines(args, ngram_size) {
                writeln!(writer, "# {line}").context("failed to write n-grams")?;
            }
            writeln!(writer).context("failed to write n-grams")?;
            for result in &results {
                write_ngrams(&mut writer, &result.ngrams)?;
            }
        }
        Format::Json => {
            serde_json::to_writer_pretty(&mut writer, &results)
                .context("failed to serialize n-grams")?;
            writer
                .write_all(b"\n")
                .context("failed to write n-grams")?;
        }
    }
    writer.flush().context("failed to write n-grams")?;

    Ok(summary)
}

fn run_trace(args: &TraceArgs) -> Result<RunSummary> {
    let program = &args.program;
    let ngram_size = trace::resolve_ngram_size(program.ngram_size, args.sequence.len())?;
    let targets = trace::parse_locations(&args.locations)?;
    let scan = load(&program.input)?;

    let mut table = filter::method_table(scan.bodies);
    let declared = filter::declared_methods(&table);
    filter::exclude_classes(&mut table, &ClassPatterns::new(&program.exclude));
    remove_over_defined(&mut table, program.max_method_definition);
    let graphs = compile_program(&table, declared, scan.deriving, program)?;
    let options = program.search_options(ngram_size);

    let traces = trace::find_traces(
        &graphs,
        &args.sequence,
        &targets,
        &options,
        &CommonObjectMethods,
    )
    .context("failed to expand traces")?;

    let mut writer = output_writer(program.output.as_deref())?;
    write_trace_metrics(&mut writer, args, &traces)?;
    write_traces(&mut writer, &args.sequence, &traces)?;
    writer.flush().context("failed to write traces")?;

    Ok(RunSummary {
        methods: graphs.len(),
        ngrams: traces.len(),
    })
}

fn load(input: &Path) -> Result<scan::ScanOutput> {
    if !input.exists() {
        anyhow::bail!("input not found: {}", input.display());
    }
    scan_inputs(input)
}

fn remove_over_defined(table: &mut MethodTable, max_method_definition: i64) {
    if let Some(max) = usize::try_from(max_method_definition)
        .ok()
        .filter(|max| *max > 0)
    {
        filter::remove_over_defined(table, max);
    }
}

fn compile_program(
    table: &MethodTable,
    declared: ClassTable,
    deriving: ClassTable,
    program: &ProgramArgs,
) -> Result<GraphTable> {
    let hierarchy = if program.no_dispatch_optimization {
        None
    } else {
        let untracked = LibraryHelperCalls;
        let metadata = untracked.metadata();
        debug!(policy = metadata.id, "{}", metadata.description);
        let hierarchy = ClassHierarchy::new(declared, deriving, Box::new(untracked));
        debug!(classes = hierarchy.class_count(), "built class hierarchy");
        Some(hierarchy)
    };
    if program.no_dispatch_optimization {
        let metadata = CommonObjectMethods.metadata();
        debug!(policy = metadata.id, "{}", metadata.description);
    }
    let options = CompileOptions {
        remove_repetition: !program.allow_repetitive_ngram,
    };
    compile_all(filter::bodies(table), hierarchy.as_ref(), options)
        .context("failed to compile method bodies")
}

/// Effective options echoed at the top of text output.
fn header_lines(args: &NgramArgs, ngram_size: usize) -> Vec<String> {
    let program = &args.program;
    let mut lines = vec![
        format!("--ngram-size={ngram_size}"),
        format!("--max-call-depth={}", program.max_call_depth),
        format!("--max-method-definition={}", program.max_method_definition),
    ];
    let flags = [
        (program.allow_repetitive_ngram, "--allow-repetitive-ngram"),
        (program.no_branch_ngram, "--no-branch-ngram"),
        (program.no_dispatch_optimization, "--no-dispatch-optimization"),
        (program.no_returning_execution_path, "--no-returning-execution-path"),
        (program.count_branch_in_surface_level, "--count-branch-in-surface-level"),
        (args.include_ctors, "--include-ctors"),
    ];
    lines.extend(
        flags
            .into_iter()
            .filter(|(enabled, _)| *enabled)
            .map(|(_, flag)| flag.to_string()),
    );
    lines.extend(program.exclude.iter().map(|pattern| format!("--exclude={pattern}")));
    lines.extend(args.entry.iter().map(|pattern| format!("--entry={pattern}")));
    lines
}

fn write_ngrams(writer: &mut dyn Write, ngrams: &[RenderedNgram]) -> Result<()> {
    for ngram in ngrams {
        for step in ngram {
            writeln!(writer, "{}\t{}\t{}", step.label, step.location, step.depth)
                .context("failed to write n-grams")?;
        }
        writeln!(writer).context("failed to write n-grams")?;
    }
    Ok(())
}

fn write_trace_metrics(writer: &mut dyn Write, args: &TraceArgs, traces: &[RenderedNgram]) -> Result<()> {
    if args.metric_clat {
        let clat = trace::common_locations(traces).len();
        writeln!(writer, "metric-clat={clat}").context("failed to write traces")?;
    }
    if args.metric_max_depth {
        let depth = trace::max_depth(traces, &args.locations);
        writeln!(writer, "metric-max-depth={depth}").context("failed to write traces")?;
    }
    if args.metric_unique_method {
        let count = trace::unique_method_count(traces, &args.sequence);
        writeln!(writer, "metric-unique-method={count}").context("failed to write traces")?;
    }
    Ok(())
}

fn write_traces(writer: &mut dyn Write, sequence: &[String], traces: &[RenderedNgram]) -> Result<()> {
    writeln!(writer, "ope:").context("failed to write traces")?;
    for label in sequence {
        writeln!(writer, "  {label}").context("failed to write traces")?;
    }
    for trace in traces {
        writeln!(writer, "trace:").context("failed to write traces")?;
        for step in trace {
            writeln!(writer, "  {} >{}", step.location, step.depth)
                .context("failed to write traces")?;
        }
    }
    Ok(())
}

fn write_diagnostic(
    writer: &mut dyn Write,
    class_count: usize,
    method_count: usize,
    table: &MethodTable,
) -> Result<()> {
    writeln!(writer, "classes: {class_count}").context("failed to write diagnostic")?;
    writeln!(writer, "method bodies: {method_count}").context("failed to write diagnostic")?;
    writeln!(writer, "method having many definitions:").context("failed to write diagnostic")?;
    for (method, count) in filter::widely_defined(table, WIDELY_DEFINED) {
        writeln!(writer, "  {count:>4} {method}").context("failed to write diagnostic")?;
    }
    Ok(())
}

/// Print each method followed by its decoded instructions, after checking
/// that its jump targets and call annotations decode.
fn write_method_bodies(writer: &mut dyn Write, bodies: &BTreeMap<MethodKey, MethodBody>) -> Result<()> {
    for (key, body) in bodies {
        compile(key, body, None, CompileOptions::default())
            .with_context(|| format!("invalid method body {key}"))?;
        writeln!(writer, "{key}").context("failed to write method bodies")?;
        for (index, instruction) in body.instructions() {
            writeln!(writer, "  {index}: {instruction}").context("failed to write method bodies")?;
        }
    }
    Ok(())
}

fn output_writer(output: Option<&Path>) -> Result<Box<dyn Write>> {
    match output {
        Some(path) if path == Path::new("-") => Ok(Box::new(io::stdout())),
        Some(path) => Ok(Box::new(
            File::create(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Ok(Box::new(io::stdout())),
    }
}
