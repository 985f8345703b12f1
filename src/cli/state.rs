use clap::Args;

use super::CliContext;
use converge_agent::command::CommandKey;
use converge_agent::logger::init_console;
use converge_agent::store::{CommandStateStore, FileStateStore, Folder};

#[derive(Args, Debug)]
pub struct StateArgs {
    /// Instance whose records to list
    pub instance: String,

    /// Only this folder (current, completed or corrupt)
    #[arg(long)]
    pub folder: Option<Folder>,
}

pub async fn execute(args: StateArgs, context: &CliContext) -> anyhow::Result<()> {
    let config = context.config().await?;
    init_console("warn");
    let store = FileStateStore::new(&config.state_dir);
    let folders = match args.folder {
        Some(folder) => vec![folder],
        None => Folder::ALL.to_vec(),
    };

    for folder in folders {
        let ids = store.list_commands(&args.instance, folder).await?;
        println!("{folder} ({}): {}", ids.len(), store.cmd_state_dir(&args.instance, folder).display());
        for command_id in ids {
            let key = CommandKey::new(&args.instance, &command_id);
            match store.get_document_info(&key, folder).await {
                Ok(info) => println!(
                    "  {command_id}  {}  reported={}  {}",
                    info.status, info.reported, info.message
                ),
                Err(e) => println!("  {command_id}  <unreadable: {e}>"),
            }
        }
    }
    Ok(())
}
