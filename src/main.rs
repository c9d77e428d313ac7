use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use swarm_controller::config::{ControllerConfig, ServerConfig};
use swarm_controller::controller::{StatusSnapshot, SwarmController};
use swarm_controller::dashboard::{
    run_dashboard, AgentStatusResponse, DashboardState, ErrorResponse, FailRequest,
    HeartbeatRequest, RegisterAgentResponse, SubmitTaskRequest, SubmitTaskResponse,
    TaskStatusResponse,
};
use swarm_controller::registry::{AgentKind, NewAgent};
use swarm_controller::scheduler::Task;
use swarm_controller::shutdown::install_shutdown_handler;
use swarm_controller::tracker::Assignment;
use swarm_controller::{AgentId, AssignmentId, TaskId};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser, Debug)]
#[command(name = "swarm-controller")]
#[command(version)]
#[command(about = "Schedules tasks across a swarm of cloud and browser agents")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the controller and its HTTP API
    Server(ServerArgs),

    /// Task management commands
    Task {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: TaskCommands,
    },

    /// Agent management commands
    Agent {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: AgentCommands,
    },

    /// Assignment lifecycle commands (normally sent by agents)
    Assignment {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: AssignmentCommands,
    },

    /// Show the swarm summary, agents and tasks
    Status {
        #[command(flatten)]
        client: ClientArgs,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address for the HTTP API and status page
    #[arg(long, env = "SWARM_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Agents silent for longer than this become unreachable
    #[arg(long, env = "SWARM_HEARTBEAT_TIMEOUT_MS", default_value_t = 5_000)]
    heartbeat_timeout_ms: u64,

    /// Assignments without progress for longer than this time out
    #[arg(long, env = "SWARM_PROGRESS_TIMEOUT_MS", default_value_t = 30_000)]
    progress_timeout_ms: u64,

    /// Failed attempts before a task is failed permanently
    #[arg(long, env = "SWARM_MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,

    /// Scheduling loop period
    #[arg(long, env = "SWARM_SCHEDULING_INTERVAL_MS", default_value_t = 100)]
    scheduling_interval_ms: u64,

    /// Heartbeat and progress sweep period
    #[arg(long, env = "SWARM_SWEEP_INTERVAL_MS", default_value_t = 1_000)]
    sweep_interval_ms: u64,

    /// Ready tasks considered per scheduling cycle
    #[arg(long, env = "SWARM_BATCH_SIZE", default_value_t = 64)]
    batch_size: usize,

    /// Idle unreachable agents are removed after this long
    #[arg(long, env = "SWARM_UNREACHABLE_GRACE_MS", default_value_t = 60_000)]
    unreachable_grace_ms: u64,

    /// Maximum number of unfinished tasks
    #[arg(long, env = "SWARM_MAX_QUEUED_TASKS", default_value_t = 10_000)]
    max_queued_tasks: usize,

    /// Finished tasks are forgotten after this long (0 keeps them forever)
    #[arg(long, env = "SWARM_FINISHED_RETENTION_MS", default_value_t = 3_600_000)]
    finished_retention_ms: u64,
}

impl ServerArgs {
    fn into_config(self) -> ServerConfig {
        let controller = ControllerConfig {
            heartbeat_timeout_ms: self.heartbeat_timeout_ms,
            progress_timeout_ms: self.progress_timeout_ms,
            max_attempts: self.max_attempts,
            scheduling_interval_ms: self.scheduling_interval_ms,
            sweep_interval_ms: self.sweep_interval_ms,
            batch_size: self.batch_size,
            unreachable_grace_ms: self.unreachable_grace_ms,
            max_queued_tasks: self.max_queued_tasks,
            finished_retention_ms: (self.finished_retention_ms > 0)
                .then_some(self.finished_retention_ms),
        };
        ServerConfig::new(self.listen).with_controller(controller)
    }
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Controller API address
    #[arg(long, short = 'a', env = "SWARM_ADDR", default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum TaskCommands {
    /// Submit a task
    Submit {
        /// vCPU-equivalent units the task needs
        #[arg(long, short = 'u', allow_negative_numbers = true)]
        units: i64,

        /// Higher runs first
        #[arg(long, short = 'p', default_value_t = 0, allow_negative_numbers = true)]
        priority: i32,

        /// Preferred agent location, e.g. US-East-1
        #[arg(long, short = 'l')]
        location: Option<String>,
    },
    /// Show one task
    Status { task_id: TaskId },
    /// Cancel a pending or assigned task
    Cancel { task_id: TaskId },
}

#[derive(clap::Subcommand, Debug)]
enum AgentCommands {
    /// Register an agent
    Register {
        #[arg(long, short = 'k', value_parser = parse_kind)]
        kind: AgentKind,

        /// vCPU-equivalent units the agent offers
        #[arg(long, short = 'c')]
        capacity: u32,

        #[arg(long, short = 'l')]
        location: String,

        /// Reuse an earlier identity when reconnecting
        #[arg(long)]
        id: Option<AgentId>,
    },
    /// Send a heartbeat
    Heartbeat {
        agent_id: AgentId,

        /// Load the agent believes it is carrying
        #[arg(long)]
        load: Option<u32>,
    },
    /// Deregister an agent
    Deregister {
        agent_id: AgentId,

        /// Remove immediately and requeue its work instead of draining
        #[arg(long)]
        force: bool,
    },
    /// List an agent's active assignments
    Assignments { agent_id: AgentId },
}

#[derive(clap::Subcommand, Debug)]
enum AssignmentCommands {
    /// Report progress as a fraction between 0 and 1
    Progress { assignment_id: AssignmentId, fraction: f64 },
    /// Mark an assignment completed
    Complete { assignment_id: AssignmentId },
    /// Mark an assignment failed
    Fail {
        assignment_id: AssignmentId,
        #[arg(long, default_value = "failed by operator")]
        reason: String,
    },
}

fn parse_kind(s: &str) -> Result<AgentKind, String> {
    s.parse().map_err(|e: swarm_controller::SwarmError| e.to_string())
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = args.into_config();
    let controller = Arc::new(SwarmController::new(config.controller.clone())?);

    tracing::info!(
        listen_addr = %config.listen_addr,
        heartbeat_timeout_ms = config.controller.heartbeat_timeout_ms,
        progress_timeout_ms = config.controller.progress_timeout_ms,
        max_attempts = config.controller.max_attempts,
        scheduling_interval_ms = config.controller.scheduling_interval_ms,
        "Starting swarm controller"
    );

    let shutdown = install_shutdown_handler();
    let loops = tokio::spawn(controller.clone().run(shutdown.clone()));

    let state = DashboardState { controller };
    let served = run_dashboard(config.listen_addr, state, shutdown.clone()).await;

    // Stop the loops even if the API server failed on its own.
    shutdown.cancel();
    if let Err(e) = loops.await {
        tracing::error!(error = %e, "Controller loops ended abnormally");
    }
    served?;
    Ok(())
}

// =============================================================================
// Client Helpers
// =============================================================================

struct ApiClient {
    http: reqwest::Client,
    base: String,
}

impl ApiClient {
    fn new(addr: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: addr.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> CliResult<T> {
        Self::decode(self.http.get(self.url(path)).send().await?).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> CliResult<T> {
        Self::decode(self.http.post(self.url(path)).json(body).send().await?).await
    }

    async fn delete<T: DeserializeOwned>(&self, path: &str) -> CliResult<T> {
        Self::decode(self.http.delete(self.url(path)).send().await?).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> CliResult<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        let message = match response.json::<ErrorResponse>().await {
            Ok(err) => format!("{} [{}]", err.error, err.code),
            Err(_) => format!("request failed with HTTP {}", status),
        };
        Err(message.into())
    }
}

fn print_json<T: Serialize>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_task(task: &Task) {
    println!("Task ID:       {}", task.id);
    println!("Status:        {}", task.status);
    println!("Units:         {}", task.required_units);
    println!("Priority:      {}", task.priority);
    if let Some(ref location) = task.preferred_location {
        println!("Location:      {}", location);
    }
    println!("Attempts:      {}", task.attempts);
    if let Some(agent) = task.assigned_agent {
        println!("Agent:         {}", agent);
    }
    if let Some(ref error) = task.last_error {
        println!("Last Error:    {}", error);
    }
}

fn print_assignments(assignments: &[Assignment]) {
    if assignments.is_empty() {
        println!("No active assignments.");
        return;
    }
    println!("{:<38} {:<38} {:<6} PROGRESS", "ASSIGNMENT ID", "TASK ID", "UNITS");
    println!("{}", "-".repeat(92));
    for a in assignments {
        println!(
            "{:<38} {:<38} {:<6} {:>3.0}%",
            a.id,
            a.task_id,
            a.units,
            a.progress * 100.0
        );
    }
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_task(client: &ClientArgs, command: TaskCommands) -> CliResult<()> {
    let api = ApiClient::new(&client.addr);
    match command {
        TaskCommands::Submit {
            units,
            priority,
            location,
        } => {
            let response: SubmitTaskResponse = api
                .post(
                    "/api/tasks",
                    &SubmitTaskRequest {
                        required_units: units,
                        priority,
                        preferred_location: location,
                    },
                )
                .await?;
            match client.output {
                OutputFormat::Json => print_json(&response)?,
                OutputFormat::Table => {
                    println!("Task submitted successfully!");
                    println!("Task ID: {}", response.task_id);
                }
            }
        }
        TaskCommands::Status { task_id } => {
            let task: Task = api.get(&format!("/api/tasks/{}", task_id)).await?;
            match client.output {
                OutputFormat::Json => print_json(&task)?,
                OutputFormat::Table => print_task(&task),
            }
        }
        TaskCommands::Cancel { task_id } => {
            let response: TaskStatusResponse = api
                .post(&format!("/api/tasks/{}/cancel", task_id), &serde_json::json!({}))
                .await?;
            match client.output {
                OutputFormat::Json => print_json(&response)?,
                OutputFormat::Table => println!("Task {} is now {}", response.task_id, response.status),
            }
        }
    }
    Ok(())
}

async fn handle_agent(client: &ClientArgs, command: AgentCommands) -> CliResult<()> {
    let api = ApiClient::new(&client.addr);
    match command {
        AgentCommands::Register {
            kind,
            capacity,
            location,
            id,
        } => {
            let mut request = NewAgent::new(kind, capacity, location);
            request.id = id;
            let response: RegisterAgentResponse = api.post("/api/agents", &request).await?;
            match client.output {
                OutputFormat::Json => print_json(&response)?,
                OutputFormat::Table => {
                    println!("Agent registered successfully!");
                    println!("Agent ID: {}", response.agent_id);
                }
            }
        }
        AgentCommands::Heartbeat { agent_id, load } => {
            let response: AgentStatusResponse = api
                .post(
                    &format!("/api/agents/{}/heartbeat", agent_id),
                    &HeartbeatRequest {
                        reported_load: load,
                    },
                )
                .await?;
            match client.output {
                OutputFormat::Json => print_json(&response)?,
                OutputFormat::Table => println!("Agent {} is {}", response.agent_id, response.status),
            }
        }
        AgentCommands::Deregister { agent_id, force } => {
            let response: AgentStatusResponse = api
                .delete(&format!("/api/agents/{}?force={}", agent_id, force))
                .await?;
            match client.output {
                OutputFormat::Json => print_json(&response)?,
                OutputFormat::Table => println!("Agent {} is {}", response.agent_id, response.status),
            }
        }
        AgentCommands::Assignments { agent_id } => {
            let assignments: Vec<Assignment> = api
                .get(&format!("/api/agents/{}/assignments", agent_id))
                .await?;
            match client.output {
                OutputFormat::Json => print_json(&assignments)?,
                OutputFormat::Table => print_assignments(&assignments),
            }
        }
    }
    Ok(())
}

async fn handle_assignment(client: &ClientArgs, command: AssignmentCommands) -> CliResult<()> {
    let api = ApiClient::new(&client.addr);
    match command {
        AssignmentCommands::Progress {
            assignment_id,
            fraction,
        } => {
            let assignment: Assignment = api
                .post(
                    &format!("/api/assignments/{}/progress", assignment_id),
                    &serde_json::json!({ "fraction": fraction }),
                )
                .await?;
            match client.output {
                OutputFormat::Json => print_json(&assignment)?,
                OutputFormat::Table => print_assignments(&[assignment]),
            }
        }
        AssignmentCommands::Complete { assignment_id } => {
            let assignment: Assignment = api
                .post(
                    &format!("/api/assignments/{}/complete", assignment_id),
                    &serde_json::json!({}),
                )
                .await?;
            match client.output {
                OutputFormat::Json => print_json(&assignment)?,
                OutputFormat::Table => println!("Assignment {} is {}", assignment.id, assignment.status),
            }
        }
        AssignmentCommands::Fail {
            assignment_id,
            reason,
        } => {
            let response: TaskStatusResponse = api
                .post(
                    &format!("/api/assignments/{}/fail", assignment_id),
                    &FailRequest { reason },
                )
                .await?;
            match client.output {
                OutputFormat::Json => print_json(&response)?,
                OutputFormat::Table => println!("Task {} is now {}", response.task_id, response.status),
            }
        }
    }
    Ok(())
}

async fn handle_status(client: &ClientArgs) -> CliResult<()> {
    let api = ApiClient::new(&client.addr);
    let status: StatusSnapshot = api.get("/api/status").await?;

    if let OutputFormat::Json = client.output {
        return print_json(&status);
    }

    let s = &status.summary;
    println!("Swarm Status");
    println!("{}", "=".repeat(40));
    println!("Cloud Agents:   {}", s.cloud_agents);
    println!("Browser Agents: {}", s.browser_agents);
    println!("Total Compute:  {} vCPUs ({} in use)", s.total_compute, s.used_compute);
    println!(
        "Tasks:          {} pending, {} assigned, {} running, {} succeeded, {} failed, {} cancelled",
        s.pending_tasks,
        s.assigned_tasks,
        s.running_tasks,
        s.succeeded_tasks,
        s.failed_tasks,
        s.cancelled_tasks
    );
    println!();

    println!("Agents:");
    println!("{:<38} {:<8} {:<12} {:<10} LOCATION", "ID", "KIND", "STATUS", "LOAD");
    println!("{}", "-".repeat(84));
    for agent in &status.agents {
        println!(
            "{:<38} {:<8} {:<12} {:<10} {}",
            agent.id,
            agent.kind,
            agent.status,
            format!("{}/{}", agent.load_used, agent.capacity),
            agent.location
        );
    }
    println!();

    println!("Tasks:");
    println!("{:<38} {:<10} {:<6} {:<8} PROGRESS", "ID", "STATUS", "UNITS", "PRIO");
    println!("{}", "-".repeat(76));
    for task in &status.tasks {
        let progress = status
            .assignments
            .iter()
            .find(|a| a.task_id == task.id && a.is_active())
            .map(|a| format!("{:.0}%", a.progress * 100.0))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<38} {:<10} {:<6} {:<8} {}",
            task.id, task.status, task.required_units, task.priority, progress
        );
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> CliResult<()> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await?,
        Commands::Task { client, command } => handle_task(&client, command).await?,
        Commands::Agent { client, command } => handle_agent(&client, command).await?,
        Commands::Assignment { client, command } => handle_assignment(&client, command).await?,
        Commands::Status { client } => handle_status(&client).await?,
    }

    Ok(())
}
