//! Hyper-V WMI CLI

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use hyperv_wmi::hyperv::VirtualMachine;
use hyperv_wmi::wmi::Connector;
use hyperv_wmi::{Service, SessionConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hvwmi")]
#[command(about = "Query and drive Hyper-V through its WMI provider", long_about = None)]
struct Cli {
    /// JSON session config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Remote host (default: local machine)
    #[arg(long, global = true)]
    server: Option<String>,
    /// WMI namespace
    #[arg(long, global = true)]
    namespace: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List virtual machines
    Vms,
    /// Show one virtual machine
    Vm {
        /// VM display name
        name: String,
    },
    /// Power on a stopped virtual machine
    Start {
        name: String,
    },
    /// Ask a running virtual machine's guest to shut down
    Stop {
        name: String,
    },
    /// Destroy a stopped virtual machine
    Remove {
        name: String,
        /// Disk image to delete once the machine is gone
        #[arg(long)]
        disk: Option<PathBuf>,
    },
    /// Run a WQL query and print every result
    Query {
        wql: String,
    },
    /// Print the object at a path
    Get {
        path: String,
    },
    /// Manage guest key/value pairs
    Kvp {
        /// VM display name
        #[arg(long)]
        vm: String,
        #[command(subcommand)]
        action: KvpAction,
    },
}

#[derive(Subcommand)]
enum KvpAction {
    /// Print the pairs pushed to the guest
    List,
    /// Add a new pair
    Add { key: String, value: String },
    /// Change an existing pair
    Modify { key: String, value: String },
    /// Add or change a pair
    Put { key: String, value: String },
    /// Remove a pair
    Remove { key: String },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let service = Service::connect(connector().as_ref(), &config)?;

    match cli.command {
        Some(Commands::Vms) | None => cmd_vms(&service)?,
        Some(Commands::Vm { name }) => cmd_vm(&service, &name)?,
        Some(Commands::Start { name }) => VirtualMachine::get_machine(&service, &name)?.start(&service)?,
        Some(Commands::Stop { name }) => VirtualMachine::get_machine(&service, &name)?.stop(&service)?,
        Some(Commands::Remove { name, disk }) => {
            VirtualMachine::get_machine(&service, &name)?.remove(&service, disk.as_deref())?
        }
        Some(Commands::Query { wql }) => cmd_query(&service, &wql)?,
        Some(Commands::Get { path }) => cmd_get(&service, &path)?,
        Some(Commands::Kvp { vm, action }) => cmd_kvp(&service, &vm, action)?,
    }

    service.close();
    Ok(())
}

fn load_config(cli: &Cli) -> hyperv_wmi::Result<SessionConfig> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::from_file(path)?,
        None => SessionConfig::default(),
    };
    if let Some(server) = &cli.server {
        config.server = Some(server.clone());
    }
    if let Some(namespace) = &cli.namespace {
        config.namespace = namespace.clone();
    }
    config.validate()?;
    Ok(config)
}

#[cfg(windows)]
fn connector() -> Box<dyn Connector> {
    Box::new(hyperv_wmi::wmi::com::ComConnector)
}

#[cfg(not(windows))]
fn connector() -> Box<dyn Connector> {
    struct Unavailable;

    impl Connector for Unavailable {
        fn connect(
            &self,
            _server: Option<&str>,
            _namespace: &str,
            _credentials: Option<&hyperv_wmi::wmi::Credentials>,
        ) -> hyperv_wmi::Result<Box<dyn hyperv_wmi::wmi::Connection>> {
            Err(hyperv_wmi::Error::Connection(
                "WMI is only available on Windows".to_string(),
            ))
        }
    }

    Box::new(Unavailable)
}

fn cmd_vms(service: &Service) -> hyperv_wmi::Result<()> {
    let vms = VirtualMachine::get_all(service)?;
    if vms.is_empty() {
        println!("No virtual machines found.");
        return Ok(());
    }

    println!("{:<30} {:<10} {:<38}", "NAME", "STATE", "ID");
    println!("{}", "-".repeat(80));
    for vm in vms {
        println!("{:<30} {:<10} {:<38}", vm.element_name, vm.state().as_str(), vm.name);
    }
    Ok(())
}

fn cmd_vm(service: &Service, name: &str) -> hyperv_wmi::Result<()> {
    let vm = VirtualMachine::get_machine(service, name)?;
    println!("{}", serde_json::to_string_pretty(&vm)?);
    Ok(())
}

fn cmd_query(service: &Service, wql: &str) -> hyperv_wmi::Result<()> {
    let mut count = 0;
    for instance in service.query(wql)? {
        let bag = instance?.properties()?;
        println!("{}", serde_json::to_string_pretty(&bag.to_json())?);
        count += 1;
    }
    eprintln!("{} object(s)", count);
    Ok(())
}

fn cmd_get(service: &Service, path: &str) -> hyperv_wmi::Result<()> {
    let bag = service.get_object(path)?.properties()?;
    println!("{}", serde_json::to_string_pretty(&bag.to_json())?);
    Ok(())
}

fn cmd_kvp(service: &Service, vm_name: &str, action: KvpAction) -> hyperv_wmi::Result<()> {
    let vm = VirtualMachine::get_machine(service, vm_name)?;
    match action {
        KvpAction::List => {
            let mut pairs: Vec<_> = vm.get_key_value_pairs(service)?.into_iter().collect();
            pairs.sort();
            for (key, value) in pairs {
                println!("{}={}", key, value);
            }
            return Ok(());
        }
        KvpAction::Add { key, value } => vm.add_key_value_pair(service, &key, &value)?,
        KvpAction::Modify { key, value } => vm.modify_key_value_pair(service, &key, &value)?,
        KvpAction::Put { key, value } => vm.put_key_value_pair(service, &key, &value)?,
        KvpAction::Remove { key } => vm.remove_key_value_pair(service, &key)?,
    }
    println!("OK");
    Ok(())
}
