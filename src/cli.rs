use clap::{Parser, Subcommand};
use guarantee_engine::api::{
    self, ChoosePayoutRequest, ResolveRequest, SubmitEvidenceRequest, VerifyMilestoneRequest,
};
use guarantee_engine::clock::SystemClock;
use guarantee_engine::config::Config;
use guarantee_engine::engine::{GuaranteeEngine, IssueRequest};
use guarantee_engine::error::{Error, Result};
use guarantee_engine::gateway::SandboxGateway;
use guarantee_engine::logger;
use guarantee_engine::state::{
    ContinuityPlan, GuaranteeInstance, GuaranteeMilestone, GuaranteeStatus, GuaranteeTemplate,
    Order,
};
use guarantee_engine::storage::{FileStorage, GuaranteeRepository, Ledger};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::str::FromStr;

type CliEngine = GuaranteeEngine<Ledger<FileStorage>, SandboxGateway, SystemClock>;

#[derive(Parser)]
#[command(name = "guarantee-engine")]
#[command(about = "Guarantee Engine CLI - conditional purchase guarantees and their payouts")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format: "human" or "json"
    #[arg(short, long, default_value = "human")]
    pub format: String,

    /// Data directory path
    #[arg(short, long)]
    pub data_dir: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the data directory
    Init,

    /// Register or replace a guarantee template
    TemplateAdd {
        /// Template JSON (or read from stdin if neither is given)
        #[arg(short, long)]
        json: Option<String>,

        /// Template JSON file path
        #[arg(short = 'i', long)]
        file: Option<String>,
    },

    /// Register or replace a continuity plan
    PlanAdd {
        #[arg(short, long)]
        json: Option<String>,

        #[arg(short = 'i', long)]
        file: Option<String>,

        /// Also create the plan's recurring price with the payment processor
        #[arg(long)]
        sync: bool,
    },

    /// Register or replace an order
    OrderAdd {
        #[arg(short, long)]
        json: Option<String>,

        #[arg(short = 'i', long)]
        file: Option<String>,
    },

    /// Issue a guarantee from a template
    Issue {
        template_id: String,

        #[arg(long)]
        email: String,

        /// Purchase amount, e.g. 1000 or 999.50
        #[arg(long)]
        amount: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        order: Option<String>,

        #[arg(long)]
        order_item: Option<String>,
    },

    /// Record an admin verdict on a milestone (id or condition slug)
    Verify {
        instance_id: String,
        milestone: String,

        /// verified | failed | waived
        #[arg(long)]
        status: String,

        #[arg(long)]
        notes: Option<String>,

        #[arg(long)]
        by: Option<String>,
    },

    /// Attach client evidence to a self-reported milestone
    Evidence {
        instance_id: String,
        milestone: String,

        #[arg(long)]
        email: String,

        #[arg(long)]
        evidence: String,
    },

    /// Evaluate a guarantee and persist any status change
    Evaluate { instance_id: String },

    /// Expire every active guarantee past its deadline
    Sweep,

    /// Resolve a guarantee with the client's payout choice
    ChoosePayout {
        instance_id: String,

        /// refund | credit | rollover_upsell | rollover_continuity
        #[arg(long)]
        payout_type: String,

        #[arg(long)]
        email: String,
    },

    /// Force a guarantee to voided or expired
    Resolve {
        instance_id: String,

        /// voided | expired
        #[arg(long)]
        resolution: String,

        #[arg(long)]
        notes: Option<String>,
    },

    /// Show a guarantee. With --email, shows the client view (evaluates first).
    Show {
        instance_id: String,

        #[arg(long)]
        email: Option<String>,
    },

    /// List guarantees, optionally filtered by status
    List {
        #[arg(long)]
        status: Option<String>,
    },
}

fn open_engine(config: &Config) -> Result<CliEngine> {
    let ledger = Ledger::open(FileStorage::new(config))?;
    let gateway = SandboxGateway::open(config.get_gateway_path())?;
    Ok(GuaranteeEngine::new(
        ledger,
        gateway,
        SystemClock,
        config.engine_settings(),
    ))
}

/// Read a JSON document from the flag, a file, or stdin
fn read_json(json: Option<String>, file: Option<&str>) -> Result<String> {
    if let Some(json) = json {
        return Ok(json);
    }
    match file {
        Some(path) => fs::read_to_string(path)
            .map_err(|e| Error::InvalidArgument(format!("Failed to read file {}: {}", path, e))),
        None => {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .map_err(|e| Error::InvalidArgument(format!("Failed to read from stdin: {}", e)))?;
            Ok(buffer)
        }
    }
}

fn parse_json<T: DeserializeOwned>(what: &str, json: &str) -> Result<T> {
    serde_json::from_str(json)
        .map_err(|e| Error::InvalidArgument(format!("Failed to parse {} JSON: {}", what, e)))
}

/// Format output based on format type
fn format_output<T: serde::Serialize + std::fmt::Debug>(data: &T, format: &str) -> Result<String> {
    match format {
        "json" => serde_json::to_string_pretty(data)
            .map_err(|e| Error::Storage(format!("Failed to serialize JSON: {}", e))),
        _ => Ok(format!("{:#?}", data)),
    }
}

fn emit<T: serde::Serialize + std::fmt::Debug>(data: &T, format: &str) -> Result<()> {
    println!("{}", format_output(data, format)?);
    Ok(())
}

pub fn run(cli: Cli) -> Result<()> {
    let mut config = Config::from_env();
    if let Some(dir) = cli.data_dir {
        config.set_data_dir(PathBuf::from(dir));
    }
    if cli.format == "json" {
        config.set_output_format("json".to_string());
    }
    logger::init(logger::normalize_level(config.get_log_level()));
    let format = config.get_output_format().to_string();
    let json = format == "json";

    if let Commands::Init = cli.command {
        fs::create_dir_all(config.get_data_dir())
            .map_err(|e| Error::Storage(format!("Failed to create data directory: {}", e)))?;
        println!("Initialized data directory at: {}", config.get_data_dir().display());
        return Ok(());
    }

    let engine = open_engine(&config)?;

    match cli.command {
        Commands::Init => Ok(()),

        Commands::TemplateAdd { json: doc, file } => {
            let template: GuaranteeTemplate =
                parse_json("template", &read_json(doc, file.as_deref())?)?;
            let id = template.id.clone();
            engine.register_template(template)?;
            println!("✓ Template {} saved", id);
            Ok(())
        }

        Commands::PlanAdd {
            json: doc,
            file,
            sync,
        } => {
            let plan: ContinuityPlan = parse_json("plan", &read_json(doc, file.as_deref())?)?;
            let id = plan.id.clone();
            engine.register_plan(plan)?;
            println!("✓ Plan {} saved", id);
            if sync {
                let plan = engine.sync_continuity_plan(&id)?;
                println!(
                    "  Synced price: {}",
                    plan.stripe_price_id.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }

        Commands::OrderAdd { json: doc, file } => {
            let order: Order = parse_json("order", &read_json(doc, file.as_deref())?)?;
            let id = order.id.clone();
            engine.register_order(order)?;
            println!("✓ Order {} saved", id);
            Ok(())
        }

        Commands::Issue {
            template_id,
            email,
            amount,
            name,
            order,
            order_item,
        } => {
            let purchase_amount = Decimal::from_str(amount.trim())
                .map_err(|e| Error::InvalidArgument(format!("Invalid amount '{}': {}", amount, e)))?;
            let (instance, milestones) = engine.issue_guarantee(
                &template_id,
                IssueRequest {
                    order_id: order,
                    order_item_id: order_item,
                    client_email: email,
                    client_name: name,
                    purchase_amount,
                    starts_at: None,
                },
            )?;
            if json {
                return emit(&ShowOutput { instance, milestones }, &format);
            }
            println!("✓ Guarantee issued: {}", instance.id);
            println!("  Expires: {}", instance.expires_at.to_rfc3339());
            println!("  Milestones: {}", milestones.len());
            Ok(())
        }

        Commands::Verify {
            instance_id,
            milestone,
            status,
            notes,
            by,
        } => {
            let request = VerifyMilestoneRequest {
                status,
                admin_notes: notes,
                verified_by: by,
            };
            let milestone = api::verify_milestone(&engine, &instance_id, &milestone, &request)?;
            if json {
                return emit(&milestone, &format);
            }
            println!("✓ {} marked {}", milestone.condition_id, milestone.status);
            Ok(())
        }

        Commands::Evidence {
            instance_id,
            milestone,
            email,
            evidence,
        } => {
            let request = SubmitEvidenceRequest {
                client_email: email,
                evidence,
            };
            let milestone = api::submit_evidence(&engine, &instance_id, &milestone, &request)?;
            if json {
                return emit(&milestone, &format);
            }
            println!("✓ Evidence recorded for {}", milestone.condition_id);
            Ok(())
        }

        Commands::Evaluate { instance_id } => {
            let response = api::evaluate(&engine, &instance_id)?;
            if json {
                return emit(&response, &format);
            }
            println!("{}: {}", response.result, response.message);
            for condition in &response.outstanding {
                println!("  - {} ({})", condition.label, condition.status);
            }
            Ok(())
        }

        Commands::Sweep => {
            let report = engine.sweep_expired()?;
            if json {
                return emit(&report, &format);
            }
            println!(
                "Checked {} overdue guarantee(s), expired {}",
                report.checked,
                report.expired.len()
            );
            for failure in &report.failed {
                println!("  ! {}: {}", failure.instance_id, failure.error);
            }
            Ok(())
        }

        Commands::ChoosePayout {
            instance_id,
            payout_type,
            email,
        } => {
            let request = ChoosePayoutRequest {
                payout_type,
                client_email: email,
            };
            let response = api::choose_payout(&engine, &instance_id, &request)?;
            if json {
                return emit(&response, &format);
            }
            println!("✓ {}", response.message);
            Ok(())
        }

        Commands::Resolve {
            instance_id,
            resolution,
            notes,
        } => {
            let request = ResolveRequest { resolution, notes };
            let instance = api::resolve(&engine, &instance_id, &request)?;
            if json {
                return emit(&instance, &format);
            }
            println!("✓ Guarantee {} is now {}", instance.id, instance.status);
            Ok(())
        }

        Commands::Show { instance_id, email } => match email {
            Some(email) => emit(&engine.view_guarantee(&instance_id, &email)?, &format),
            None => {
                let instance = engine
                    .repo()
                    .load_instance(&instance_id)?
                    .ok_or_else(|| {
                        Error::NotFound(format!("Guarantee instance {} not found", instance_id))
                    })?;
                let milestones = engine.repo().load_milestones(&instance_id)?;
                emit(&ShowOutput { instance, milestones }, &format)
            }
        },

        Commands::List { status } => {
            let status = status
                .as_deref()
                .map(GuaranteeStatus::from_str)
                .transpose()?;
            let rows: Vec<ListRow> = engine
                .repo()
                .list_instances(status)?
                .into_iter()
                .map(|g| ListRow {
                    id: g.id,
                    status: g.status,
                    client_email: g.client_email,
                    purchase_amount: g.purchase_amount,
                    expires_at: g.expires_at.to_rfc3339(),
                })
                .collect();
            if json {
                return emit(&rows, &format);
            }
            for row in &rows {
                println!(
                    "{}  {:<28} {:<24} {:>10}  {}",
                    row.id,
                    row.status.as_str(),
                    row.client_email,
                    row.purchase_amount.to_string(),
                    row.expires_at
                );
            }
            Ok(())
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct ShowOutput {
    instance: GuaranteeInstance,
    milestones: Vec<GuaranteeMilestone>,
}

#[derive(Debug, serde::Serialize)]
struct ListRow {
    id: String,
    status: GuaranteeStatus,
    client_email: String,
    purchase_amount: Decimal,
    expires_at: String,
}
