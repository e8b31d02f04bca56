use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use wikimigrate_core::attachments::{DownloadReport, UploadReport, upload_assets_with_api};
use wikimigrate_core::audit::{AuditReport, audit_with_api};
use wikimigrate_core::config::{MigrateConfig, load_config};
use wikimigrate_core::export::export_space;
use wikimigrate_core::ledger::Ledger;
use wikimigrate_core::migrate::{latest_version, pending_migration_count};
use wikimigrate_core::model::AssetKind;
use wikimigrate_core::pipeline::{self, PrepareReport};
use wikimigrate_core::publish::{PublishContext, PublishReport};
use wikimigrate_core::rewrite::{LinkOutcome, RewriteReport, parse_pass, rewrite_with_api};
use wikimigrate_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, ensure_runtime_initialized,
    init_layout, inspect_runtime, normalize_for_display, resolve_paths,
};
use wikimigrate_core::source::{AssemblaClient, AssemblaClientConfig};
use wikimigrate_core::target::{ConfluenceClient, ConfluenceClientConfig};
use wikimigrate_core::tickets::import_ticket_keys;

#[derive(Debug, Parser)]
#[command(
    name = "wikimigrate",
    version,
    about = "Migrate an Assembla wiki space (pages, documents, ticket links) to Confluence"
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "BOOL",
        default_value_t = true,
        action = ArgAction::Set,
        help = "Report target writes instead of performing them"
    )]
    dry_run: bool,
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print reports as JSON")]
    json: bool,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    dry_run: bool,
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    json: bool,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            dry_run: cli.dry_run,
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            json: cli.json,
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create the .wikimigrate/ layout and a commented config.toml")]
    Init(InitArgs),
    #[command(about = "Pull spaces, wiki pages, users and tickets from the source")]
    Export(ExportArgs),
    Tickets(TicketsArgs),
    #[command(about = "Validate the page tree, normalize bodies and extract links")]
    Prepare(PrepareArgs),
    #[command(about = "Download every referenced image and document")]
    Download,
    #[command(about = "Create target pages in pre-order")]
    Publish,
    Upload(UploadArgs),
    #[command(about = "Run one link rewrite pass over published pages")]
    Rewrite(RewriteArgs),
    #[command(about = "Run prepare, download, publish, uploads and every rewrite pass")]
    Run,
    #[command(about = "Report leftover source markup in published pages")]
    Audit(AuditArgs),
    Status,
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config.toml")]
    force: bool,
    #[arg(long, help = "Skip writing .wikimigrate/config.toml")]
    no_config: bool,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[arg(long, value_name = "NAME", help = "Source space name, wiki name or id")]
    space: Option<String>,
}

#[derive(Debug, Args)]
struct TicketsArgs {
    #[command(subcommand)]
    command: TicketsSubcommand,
}

#[derive(Debug, Subcommand)]
enum TicketsSubcommand {
    #[command(about = "Load ticket number to issue key rows from a JSON file")]
    Import { path: PathBuf },
}

#[derive(Debug, Args)]
struct PrepareArgs {
    #[arg(long, help = "Print the page tree")]
    tree: bool,
}

#[derive(Debug, Args)]
struct UploadArgs {
    #[command(subcommand)]
    command: UploadSubcommand,
}

#[derive(Debug, Subcommand)]
enum UploadSubcommand {
    Images,
    Documents,
}

#[derive(Debug, Args)]
struct RewriteArgs {
    #[arg(value_name = "PASS", help = "images, pages, md-pages, md-urls, documents or tickets")]
    pass: String,
}

#[derive(Debug, Args)]
struct AuditArgs {
    #[arg(long, help = "List every finding instead of per-kind counts")]
    details: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Export(args)) => run_export(&runtime, args),
        Some(Commands::Tickets(TicketsArgs {
            command: TicketsSubcommand::Import { path },
        })) => run_tickets_import(&runtime, &path),
        Some(Commands::Prepare(args)) => run_prepare(&runtime, args),
        Some(Commands::Download) => run_download(&runtime),
        Some(Commands::Publish) => run_publish(&runtime),
        Some(Commands::Upload(UploadArgs { command })) => match command {
            UploadSubcommand::Images => run_upload(&runtime, AssetKind::Image),
            UploadSubcommand::Documents => run_upload(&runtime, AssetKind::Document),
        },
        Some(Commands::Rewrite(args)) => run_rewrite(&runtime, &args.pass),
        Some(Commands::Run) => run_all(&runtime),
        Some(Commands::Audit(args)) => run_audit(&runtime, args),
        Some(Commands::Status) => run_status(&runtime),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

/// Everything a migration phase needs: resolved paths, parsed config and an open ledger.
struct Session {
    paths: ResolvedPaths,
    config: MigrateConfig,
    ledger: Ledger,
}

impl Session {
    fn open(runtime: &RuntimeOptions) -> Result<Self> {
        let paths = resolve_runtime_paths(runtime)?;
        let status = inspect_runtime(&paths)?;
        ensure_runtime_initialized(&paths, &status)?;
        let config = load_config(&paths.config_path)?;
        let ledger = Ledger::open(&paths)?;
        Ok(Self {
            paths,
            config,
            ledger,
        })
    }

    fn source_client(&self) -> Result<AssemblaClient> {
        AssemblaClient::new(AssemblaClientConfig::from_config(&self.config)?)
    }

    fn target_client(&self) -> Result<ConfluenceClient> {
        ConfluenceClient::new(ConfluenceClientConfig::from_config(&self.config)?)
    }

    fn publish_context(&self) -> Result<PublishContext> {
        let Some(wiki_url) = self.config.wiki_url() else {
            bail!("source wiki url is not configured (ASSEMBLA_WIKI)");
        };
        Ok(PublishContext::new(&wiki_url, &self.ledger.users()?))
    }

    fn finish(&self, runtime: &RuntimeOptions) {
        if runtime.diagnostics {
            println!("\n[diagnostics]\n{}", self.paths.diagnostics());
        }
    }
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            materialize_config: !args.no_config,
            force: args.force,
        },
    )?;
    let ledger = Ledger::open(&paths)?;
    let counts = ledger.counts()?;

    println!("Initialized wikimigrate runtime layout");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("state_dir: {}", normalize_for_display(&paths.state_dir));
    println!("data_dir: {}", normalize_for_display(&paths.data_dir));
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("attachments_dir: {}", normalize_for_display(&paths.attachments_dir));
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("ledger.schema_version: {}", latest_version());
    println!("ledger.pages: {}", counts.pages);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_export(runtime: &RuntimeOptions, args: ExportArgs) -> Result<()> {
    let mut session = Session::open(runtime)?;
    let Some(space) = args.space.or_else(|| session.config.source_space()) else {
        bail!("source space is not configured (pass --space or set ASSEMBLA_SPACE)");
    };
    let ticket_report = session.config.ticket_report();
    let mut source = session.source_client()?;
    let report = export_space(&mut session.ledger, &space, ticket_report, &mut source)?;

    if runtime.json {
        print_json(&report)?;
    } else {
        println!("export");
        println!("space: {} ({})", report.space_name, report.space_id);
        println!("spaces: {}", report.spaces);
        println!("pages: {}", report.pages);
        println!("users: {}", report.users);
        println!("tickets: {}", report.tickets);
        println!("request_count: {}", report.request_count);
        println!("next: wikimigrate prepare");
    }
    session.finish(runtime);
    Ok(())
}

fn run_tickets_import(runtime: &RuntimeOptions, path: &Path) -> Result<()> {
    let mut session = Session::open(runtime)?;
    let report = import_ticket_keys(&mut session.ledger, path)?;

    if runtime.json {
        print_json(&report)?;
    } else {
        println!("tickets import");
        println!("path: {}", normalize_for_display(path));
        println!("rows: {}", report.rows);
        println!("imported: {}", report.imported);
        println!("ignored: {}", report.ignored);
        println!("duplicates: {}", report.duplicates.len());
        for duplicate in &report.duplicates {
            println!("  - {duplicate}");
        }
    }
    session.finish(runtime);
    Ok(())
}

fn run_prepare(runtime: &RuntimeOptions, args: PrepareArgs) -> Result<()> {
    let mut session = Session::open(runtime)?;
    let report = pipeline::prepare(&mut session.ledger)?;

    if runtime.json {
        print_json(&report)?;
    } else {
        print_prepare_report(&report);
        if args.tree {
            println!("tree:");
            for line in &report.tree {
                println!("  {line}");
            }
        }
    }
    session.finish(runtime);
    Ok(())
}

fn run_download(runtime: &RuntimeOptions) -> Result<()> {
    let session = Session::open(runtime)?;
    let space_id = pipeline::source_space_id(&session.ledger)?;
    let mut source = session.source_client()?;
    let report = wikimigrate_core::attachments::download_attachments(
        &session.ledger,
        &space_id,
        &session.paths.attachments_dir,
        &mut source,
    )?;

    if runtime.json {
        print_json(&report)?;
    } else {
        print_download_report(&report);
    }
    session.finish(runtime);
    Ok(())
}

fn run_publish(runtime: &RuntimeOptions) -> Result<()> {
    let session = Session::open(runtime)?;
    let context = session.publish_context()?;
    let mut target = session.target_client()?;
    let report = pipeline::publish(&session.ledger, &context, runtime.dry_run, &mut target)?;

    if runtime.json {
        print_json(&report)?;
    } else {
        print_publish_report(&report);
    }
    session.finish(runtime);
    Ok(())
}

fn run_upload(runtime: &RuntimeOptions, asset: AssetKind) -> Result<()> {
    let session = Session::open(runtime)?;
    let mut target = session.target_client()?;
    let report = upload_assets_with_api(
        &session.ledger,
        &session.paths.attachments_dir,
        asset,
        runtime.dry_run,
        &mut target,
    )?;

    if runtime.json {
        print_json(&report)?;
    } else {
        print_upload_report(&report);
    }
    session.finish(runtime);
    Ok(())
}

fn run_rewrite(runtime: &RuntimeOptions, pass: &str) -> Result<()> {
    let pass = parse_pass(pass)?;
    let session = Session::open(runtime)?;
    let mut target = session.target_client()?;
    let report = rewrite_with_api(&session.ledger, pass, runtime.dry_run, &mut target)?;

    if runtime.json {
        print_json(&report)?;
    } else {
        print_rewrite_report(&report);
    }
    session.finish(runtime);
    Ok(())
}

fn run_all(runtime: &RuntimeOptions) -> Result<()> {
    let mut session = Session::open(runtime)?;
    let context = session.publish_context()?;
    let mut source = session.source_client()?;
    let mut target = session.target_client()?;
    let report = pipeline::run_all(
        &mut session.ledger,
        &session.paths,
        &context,
        runtime.dry_run,
        &mut source,
        &mut target,
    )?;

    if runtime.json {
        print_json(&report)?;
    } else {
        print_prepare_report(&report.prepare);
        println!();
        print_download_report(&report.download);
        println!();
        print_publish_report(&report.publish);
        for upload in &report.uploads {
            println!();
            print_upload_report(upload);
        }
        for rewrite in &report.rewrites {
            println!();
            print_rewrite_report(rewrite);
        }
    }
    session.finish(runtime);
    Ok(())
}

fn run_audit(runtime: &RuntimeOptions, args: AuditArgs) -> Result<()> {
    let session = Session::open(runtime)?;
    let mut target = session.target_client()?;
    let report = audit_with_api(&session.ledger, &mut target)?;

    if runtime.json {
        print_json(&report)?;
    } else {
        print_audit_report(&report, args.details);
    }
    session.finish(runtime);
    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let runtime_status = inspect_runtime(&paths)?;
    let pending = pending_migration_count(&paths.db_path)?;

    println!("runtime status");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("state_dir_exists: {}", format_flag(runtime_status.state_dir_exists));
    println!("data_dir_exists: {}", format_flag(runtime_status.data_dir_exists));
    println!("db_exists: {}", format_flag(runtime_status.db_exists));
    println!(
        "db_size_bytes: {}",
        runtime_status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!(
        "attachments_dir_exists: {}",
        format_flag(runtime_status.attachments_dir_exists)
    );
    println!("config_exists: {}", format_flag(runtime_status.config_exists));
    println!("ledger.pending_migrations: {pending}");
    for warning in &runtime_status.warnings {
        println!("warning: {warning}");
    }

    if runtime_status.db_exists {
        let ledger = Ledger::open(&paths)?;
        let report = pipeline::status(&ledger, &paths)?;
        if runtime.json {
            print_json(&report)?;
        } else {
            let counts = &report.counts;
            let checks = &report.verification;
            println!(
                "source_space: {}",
                report.space_id.as_deref().unwrap_or("<not exported>")
            );
            println!("pages: {}", counts.pages);
            println!("pages.normalized: {}", counts.normalized_pages);
            println!("users: {}", counts.users);
            println!("tickets: {}", counts.tickets);
            println!("ticket_keys: {}", counts.ticket_keys);
            println!("links: {}", counts.links);
            println!("attachments: {}", counts.attachments);
            println!("mappings: {}", counts.mappings);
            println!("uploads.ok: {}", counts.uploads_ok);
            println!("uploads.failed: {}", counts.uploads_failed);
            println!(
                "links.images_downloaded: {}/{}",
                checks.images_downloaded, checks.images
            );
            println!(
                "links.documents_downloaded: {}/{}",
                checks.documents_downloaded, checks.documents
            );
            println!(
                "links.tickets_known: {}/{}",
                checks.tickets_known, checks.ticket_links
            );
            println!(
                "links.titles_known: {}/{}",
                checks.titles_known, checks.page_links
            );
            println!("publish_failures: {}", report.publish_failures.len());
            for failure in &report.publish_failures {
                println!(
                    "  - {} ({}): {}",
                    failure.title, failure.source_page_id, failure.error
                );
            }
        }
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn print_prepare_report(report: &PrepareReport) {
    println!("prepare");
    println!("pages: {}", report.pages);
    println!("pages.html: {}", report.html_pages);
    println!("pages.plain: {}", report.plain_pages);
    println!("pages.root: {}", report.root_pages);
    println!("links: {}", report.links.total);
    for (kind, count) in &report.links.by_kind {
        println!("links.{kind}: {count}");
    }
    for (target, count) in &report.links.anchors_by_target {
        println!("links.anchor.{target}: {count}");
    }
    println!("warnings: {}", report.warnings.len());
    for warning in &report.warnings {
        println!("  - {warning}");
    }
}

fn print_download_report(report: &DownloadReport) {
    println!("download");
    println!("links_considered: {}", report.links_considered);
    println!("unique_attachments: {}", report.unique_attachments);
    println!("downloaded: {}", report.downloaded);
    println!("already_present: {}", report.already_present);
    println!("missing: {}", report.missing);
    println!("failed: {}", report.failed);
    println!("request_count: {}", report.request_count);
    print_errors(&report.errors);
}

fn print_publish_report(report: &PublishReport) {
    println!("publish");
    println!("dry_run: {}", report.dry_run);
    println!("pages: {}", report.total);
    println!("created: {}", report.created);
    println!("already_published: {}", report.already_published);
    println!("reparented_to_root: {}", report.reparented_to_root);
    println!("failed: {}", report.failed);
    println!("request_count: {}", report.request_count);
    if report.dry_run {
        for page in &report.pages {
            println!(
                "  {} {} ({}){}",
                page.action,
                page.title,
                page.source_page_id,
                page.detail
                    .as_deref()
                    .map(|detail| format!(": {detail}"))
                    .unwrap_or_default()
            );
        }
    }
    print_errors(&report.errors);
}

fn print_upload_report(report: &UploadReport) {
    println!("upload {}", report.asset.as_str());
    println!("dry_run: {}", report.dry_run);
    println!("considered: {}", report.considered);
    println!("uploaded: {}", report.uploaded);
    println!("reused: {}", report.reused);
    println!("already_uploaded: {}", report.already_uploaded);
    println!("failed: {}", report.failed);
    println!("request_count: {}", report.request_count);
    if report.dry_run {
        for item in &report.items {
            println!(
                "  {} {} on page {}",
                item.action,
                item.filename.as_deref().unwrap_or(&item.link),
                item.page_id
            );
        }
    }
    print_errors(&report.errors);
}

fn print_rewrite_report(report: &RewriteReport) {
    println!("rewrite {}", report.pass.as_str());
    println!("dry_run: {}", report.dry_run);
    println!("pages_considered: {}", report.pages_considered);
    println!("pages_updated: {}", report.pages_updated);
    println!("pages_unchanged: {}", report.pages_unchanged);
    println!("pages_skipped: {}", report.pages_skipped);
    println!("pages_failed: {}", report.pages_failed);
    println!("links.ok: {}", report.links_ok);
    println!("links.nok: {}", report.links_nok);
    println!("links.skipped: {}", report.links_skipped);
    println!("request_count: {}", report.request_count);
    for page in &report.pages {
        for link in &page.links {
            if let LinkOutcome::Nok(reason) = &link.outcome {
                println!(
                    "  NOK {} #{} {}: {reason}",
                    page.source_page_id, link.ordinal, link.raw_value
                );
            }
        }
        if let Some(changed) = page.changed_lines
            && report.dry_run
        {
            println!(
                "  {} {} ({changed} lines)",
                page.action,
                page.title.as_deref().unwrap_or(&page.source_page_id)
            );
        }
    }
    print_errors(&report.errors);
}

fn print_audit_report(report: &AuditReport, details: bool) {
    println!("audit");
    println!("pages_checked: {}", report.pages_checked);
    println!("pages_with_findings: {}", report.pages_with_findings);
    let mut counts = report.counts.iter().collect::<Vec<_>>();
    counts.sort();
    for (kind, count) in counts {
        println!("findings.{kind}: {count}");
    }
    println!("unknown_tickets: {}", report.unknown_tickets);
    println!("request_count: {}", report.request_count);
    if details {
        for page in &report.pages {
            println!("page: {} ({})", page.title, page.target_page_id);
            for finding in &page.findings {
                match &finding.issue_key {
                    Some(key) => println!("  {} {} -> {key}", finding.kind.as_str(), finding.text),
                    None => println!("  {} {}", finding.kind.as_str(), finding.text),
                }
            }
        }
    }
    print_errors(&report.errors);
}

fn print_errors(errors: &[String]) {
    if errors.is_empty() {
        return;
    }
    println!("errors: {}", errors.len());
    for error in errors {
        println!("  - {error}");
    }
}

fn print_json<T: Serialize>(report: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(report).context("failed to render report")?;
    println!("{rendered}");
    Ok(())
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
