/// `fluence` CLI — a minimal smoke binary.
///
/// The lexer/parser are out of scope for this crate (spec §1), so there is
/// no `fluence run script.fl`. What this binary does: dump the properties a
/// conf file would set (`conf-dump`), and run a trivial built-in program to
/// completion, printing its disassembly and final opcode/IC statistics
/// (`smoke`) — mainly useful for exercising the VM plumbing end to end.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fluence::conf::FluenceConf;
use fluence::instruction::{dump_bytecode, InstructionLine, Op};
use fluence::symbol::SymbolTable;
use fluence::vm::Vm;

#[derive(Parser)]
#[command(name = "fluence", version, about = "Fluence execution-core smoke binary")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the default configuration as `property=value` text.
    ConfDump,
    /// Run a trivial built-in no-op program and report IC stats.
    Smoke {
        /// Optional `property=value` conf file overriding defaults.
        #[arg(long)]
        conf: Option<PathBuf>,
    },
}

fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::ConfDump => {
            print!("{}", FluenceConf::defaults().render());
        }
        Commands::Smoke { conf } => {
            let conf = match conf {
                Some(path) => {
                    let text = std::fs::read_to_string(&path).unwrap_or_default();
                    FluenceConf::parse(&text)
                }
                None => FluenceConf::defaults(),
            };
            let code = vec![InstructionLine::new(Op::Terminate)];
            println!("{}", dump_bytecode(&code));
            let mut vm = Vm::new(code, SymbolTable::new(), 0, conf);
            vm.run_until_done().map_err(|report| miette::miette!("{report}"))?;
            println!("{}", vm.ic_stats().dump());
        }
    }
    Ok(())
}
