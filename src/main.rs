#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::path::PathBuf;

use anyhow::{anyhow, Context};
use indicatif::{ProgressBar, ProgressStyle};

use stm32_rom_flasher::linux::{LinuxProgrammer, ModemLines};
use stm32_rom_flasher::{Options, Programmer};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    /// Invert the reset line (DTR)
    #[structopt(long)]
    invert_reset: bool,

    /// Invert the BOOT0 line (RTS)
    #[structopt(long)]
    invert_boot0: bool,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    action: Action,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Action {
    /// Identify the target and print its flash geometry
    Detect,
    /// Print the bootloader version and option bytes
    Version,
    /// List the commands supported by the bootloader
    Commands,
    /// Erase the whole flash
    Erase,
    /// Program a binary image
    Flash {
        /// Binary image to write
        file: PathBuf,

        /// Start address, defaults to the flash base of the detected device
        #[structopt(long, parse(try_from_str = parse_hex))]
        address: Option<u32>,

        /// Mass erase before writing
        #[structopt(long)]
        erase: bool,
    },
    /// Read memory
    Read {
        /// Start address
        #[structopt(parse(try_from_str = parse_hex))]
        address: u32,

        /// Number of bytes to read
        length: usize,

        /// Write to a file instead of printing a hex dump
        #[structopt(long)]
        output: Option<PathBuf>,
    },
    /// Write and read back a test pattern in RAM
    TestRam,
    /// Read the flash size register
    FlashSize,
    /// Reset into the user application
    Jump,
}

fn parse_hex(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(h) => u32::from_str_radix(h, 16),
        None => s.parse(),
    }
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    info!("Connecting to serial port");

    let lines = ModemLines {
        invert_reset: o.invert_reset,
        invert_boot0: o.invert_boot0,
    };

    let mut p = match Programmer::linux(&o.port, o.baud, lines, o.options.clone()) {
        Ok(p) => p,
        Err(e) => {
            error!("Error connecting to serial port: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&mut p, o.action) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(p: &mut LinuxProgrammer, action: Action) -> anyhow::Result<()> {
    p.begin().context("setting idle line levels")?;

    match action {
        Action::Detect => {
            let desc = p.detect().context("detecting target")?;
            let d = p.device();
            info!("{}", desc);
            info!(
                "Family: {}, erase: {} ({} ms), flash start: 0x{:08x}, RAM test: 0x{:08x}",
                d.family,
                d.erase_cmd.command(),
                d.erase_timeout_ms,
                d.flash_start,
                d.ram_test_addr
            );
        }
        Action::Version => {
            let v = p.version().context("reading version")?;
            info!("{}", v);
        }
        Action::Commands => {
            let c = p.commands().context("reading supported commands")?;
            info!("{}", c);
        }
        Action::Erase => {
            p.detect().context("detecting target")?;
            p.mass_erase().context("erasing flash")?;
            info!("Erase OK");
        }
        Action::Flash {
            file,
            address,
            erase,
        } => {
            let image = std::fs::read(&file)
                .with_context(|| format!("reading {}", file.display()))?;

            p.detect().context("detecting target")?;

            let flash_bytes = p.flash_kb() as usize * 1024;
            if image.len() > flash_bytes {
                warn!(
                    "Image ({}) is larger than device flash ({})",
                    bytefmt::format(image.len() as u64),
                    bytefmt::format(flash_bytes as u64)
                );
            }

            let addr = address.unwrap_or_else(|| p.flash_start());
            info!(
                "Writing {} to 0x{:08x}",
                bytefmt::format(image.len() as u64),
                addr
            );

            let pb = ProgressBar::new(image.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner} [{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes}")
                    .progress_chars("=> "),
            );

            p.program(addr, &image, erase, |done, _total| pb.set_position(done as u64))
                .context("programming flash")?;

            pb.finish();
            info!("Upload OK, Bytes = {}", image.len());
        }
        Action::Read {
            address,
            length,
            output,
        } => {
            if length == 0 {
                return Err(anyhow!("length must be non-zero"));
            }

            let mut data = vec![0u8; length];
            p.read_memory(address, &mut data)
                .context("reading memory")?;

            match output {
                Some(path) => {
                    std::fs::write(&path, &data)
                        .with_context(|| format!("writing {}", path.display()))?;
                    info!(
                        "Wrote {} to {}",
                        bytefmt::format(data.len() as u64),
                        path.display()
                    );
                }
                None => {
                    for (i, line) in data.chunks(16).enumerate() {
                        println!(
                            "{:08x}: {}",
                            address.wrapping_add(i as u32 * 16),
                            hex::encode(line)
                        );
                    }
                }
            }
        }
        Action::TestRam => {
            p.detect().context("detecting target")?;
            let msg = p.test_ram().context("RAM test")?;
            info!("{}", msg);
        }
        Action::FlashSize => {
            p.detect().context("detecting target")?;
            let kb = p.read_flash_size_kb();
            p.exit_to_application().context("resetting into application")?;
            info!("Flash size: {} KB", kb.context("reading flash size")?);
        }
        Action::Jump => {
            p.exit_to_application()
                .context("resetting into application")?;
            info!("Jump to application.");
        }
    }

    Ok(())
}
