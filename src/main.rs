use clap::{Parser, Subcommand};
use sce_codec::cli::{
    decrypt_file, encrypt_file, print_keys, show_info, DecryptOptions, EncryptOptions,
};
use sce_codec::config::{self, DataPaths, DecodeOverrides, KeyMaterialPolicy, KeyOverrides};
use sce_codec::header::{ContainerType, LicenseType, NpAppType, SelfType};
use sce_codec::image::extended::CONTROL_FLAGS_SIZE;
use sce_codec::license::Klicensee;
use sce_codec::metadata::{CAPABILITY_FLAGS_SIZE, METADATA_INFO_SIZE};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Version info from build.rs
const VERSION: &str = env!("SCECODEC_VERSION");
const PROFILE: &str = env!("SCECODEC_PROFILE");
const GIT_HASH: &str = env!("SCECODEC_GIT_HASH");

/// Raw hex argument; a plain `Vec<u8>` would make clap expect repeated values
type HexBytes = Vec<u8>;

fn get_version() -> &'static str {
    use std::sync::OnceLock;
    static VERSION_STRING: OnceLock<String> = OnceLock::new();
    VERSION_STRING.get_or_init(|| format!("{} {} ({})", PROFILE, VERSION, GIT_HASH))
}

#[derive(Parser)]
#[command(name = "scecodec")]
#[command(author, about = "Build and open signed, encrypted SCE containers", long_about = None)]
struct Cli {
    /// Print version
    #[arg(short = 'V', long)]
    version: bool,

    /// Directory holding keys, ldr_curves and vsh_curves
    #[arg(short = 'd', long, global = true)]
    data_path: Option<PathBuf>,

    /// Log every pipeline step to stderr
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Also print key material and raw structures
    #[arg(short = 'r', long, global = true)]
    raw: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List the loaded keyset
    #[command(alias = "k")]
    PrintKeys,

    /// Show information about a container
    #[command(alias = "i")]
    PrintInfos {
        /// Container to inspect
        file: PathBuf,

        /// Override keyset: erk[32] riv[16], optionally pub[40] priv[21] curve[1], hex
        #[arg(long, value_parser = parse_hex_vec)]
        keyset: Option<HexBytes>,

        /// License key for NPDRM images, hex
        #[arg(long, value_parser = parse_klicensee)]
        np_klicensee: Option<Klicensee>,
    },

    /// Decrypt a container to its executable or raw payload
    #[command(alias = "d")]
    Decrypt {
        input: PathBuf,
        output: PathBuf,

        /// Override keyset, hex
        #[arg(long, value_parser = parse_hex_vec)]
        keyset: Option<HexBytes>,

        /// Plaintext metadata info (key[16] pad[16] iv[16] pad[16]), hex
        #[arg(long, value_parser = parse_hex_array::<METADATA_INFO_SIZE>)]
        meta_info: Option<[u8; METADATA_INFO_SIZE]>,

        /// License key for NPDRM images, hex
        #[arg(long, value_parser = parse_klicensee)]
        np_klicensee: Option<Klicensee>,

        /// Worker threads for section processing
        #[arg(long)]
        threads: Option<usize>,
    },

    /// Encrypt an ELF executable or raw payload into a container
    #[command(alias = "e")]
    Encrypt {
        input: PathBuf,
        output: PathBuf,

        /// Existing container to copy attributes from
        #[arg(long)]
        template: Option<PathBuf>,

        /// SELF, RVK, PKG or SPP
        #[arg(long, value_parser = parse_enum::<ContainerType>)]
        sce_type: Option<ContainerType>,

        /// Compress loadable segments
        #[arg(long, value_parser = parse_bool)]
        compress_data: Option<bool>,

        /// Store non-loadable segments unencrypted
        #[arg(long, value_parser = parse_bool)]
        skip_sections: Option<bool>,

        /// Key revision, hex with 0x prefix or decimal
        #[arg(long, value_parser = parse_u16)]
        key_revision: Option<u16>,

        /// derived or random
        #[arg(long, value_parser = parse_enum::<KeyMaterialPolicy>)]
        key_policy: Option<KeyMaterialPolicy>,

        /// Plaintext metadata info to use instead of generating one, hex
        #[arg(long, value_parser = parse_hex_array::<METADATA_INFO_SIZE>)]
        meta_info: Option<[u8; METADATA_INFO_SIZE]>,

        /// Override keyset, hex
        #[arg(long, value_parser = parse_hex_vec)]
        keyset: Option<HexBytes>,

        /// Authentication id, hex
        #[arg(long, value_parser = parse_hex_u64)]
        self_auth_id: Option<u64>,

        /// Vendor id, hex
        #[arg(long, value_parser = parse_hex_u32)]
        self_vendor_id: Option<u32>,

        /// LV0, LV1, LV2, APP, ISO, LDR, UNK7 or NPDRM
        #[arg(long, value_parser = parse_enum::<SelfType>)]
        self_type: Option<SelfType>,

        /// Application version, hex
        #[arg(long, value_parser = parse_hex_u64)]
        self_app_version: Option<u64>,

        /// Firmware version, hex
        #[arg(long, value_parser = parse_hex_u64)]
        self_fw_version: Option<u64>,

        /// Carry the ELF section headers
        #[arg(long, value_parser = parse_bool)]
        self_add_shdrs: Option<bool>,

        /// Control flags (32 bytes), hex
        #[arg(long, value_parser = parse_hex_array::<CONTROL_FLAGS_SIZE>)]
        self_ctrl_flags: Option<[u8; CONTROL_FLAGS_SIZE]>,

        /// Capability flags (32 bytes), hex
        #[arg(long, value_parser = parse_hex_array::<CAPABILITY_FLAGS_SIZE>)]
        self_cap_flags: Option<[u8; CAPABILITY_FLAGS_SIZE]>,

        /// Individuals seed (256 bytes), hex
        #[arg(long, value_parser = parse_hex_vec)]
        self_indiv_seed: Option<HexBytes>,

        /// NETWORK, LOCAL or FREE
        #[arg(long, value_parser = parse_enum::<LicenseType>)]
        np_license_type: Option<LicenseType>,

        /// SPRX, EXEC, USPRX or UEXEC
        #[arg(long, value_parser = parse_enum::<NpAppType>)]
        np_app_type: Option<NpAppType>,

        /// Content id, at most 48 characters
        #[arg(long)]
        np_content_id: Option<String>,

        /// License key, hex
        #[arg(long, value_parser = parse_klicensee)]
        np_klicensee: Option<Klicensee>,

        /// Installed filename, defaults to the output filename
        #[arg(long)]
        np_real_fname: Option<String>,

        /// Worker threads for section processing
        #[arg(long)]
        threads: Option<usize>,
    },
}

fn parse_enum<T>(s: &str) -> Result<T, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    s.parse().map_err(|e: T::Err| format!("{}", e))
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(format!("expected TRUE or FALSE, got {}", s)),
    }
}

fn parse_u16(s: &str) -> Result<u16, String> {
    config::parse_u16(s).map_err(|e| format!("{}", e))
}

fn parse_hex_u32(s: &str) -> Result<u32, String> {
    config::parse_hex_u32(s).map_err(|e| format!("{}", e))
}

fn parse_hex_u64(s: &str) -> Result<u64, String> {
    config::parse_hex_u64(s).map_err(|e| format!("{}", e))
}

fn parse_hex_vec(s: &str) -> Result<HexBytes, String> {
    config::parse_hex_vec(s).map_err(|e| format!("{}", e))
}

fn parse_hex_array<const N: usize>(s: &str) -> Result<[u8; N], String> {
    config::parse_hex_array::<N>(s).map_err(|e| format!("{}", e))
}

fn parse_klicensee(s: &str) -> Result<Klicensee, String> {
    config::parse_klicensee(s).map_err(|e| format!("{}", e))
}

fn init_logging(verbose: bool) {
    let log_level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy();

    let stderr_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_filter(env_filter);

    tracing_subscriber::registry().with(stderr_layer).init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.version {
        println!("scecodec {}", get_version());
        return ExitCode::SUCCESS;
    }

    let command = match cli.command {
        Some(cmd) => cmd,
        None => {
            use clap::CommandFactory;
            if let Err(e) = Cli::command().print_help() {
                eprintln!("Error: {}", e);
                return ExitCode::FAILURE;
            }
            println!();
            return ExitCode::SUCCESS;
        }
    };

    init_logging(cli.verbose);
    let paths = DataPaths::resolve(cli.data_path.as_deref());

    let result = match command {
        Commands::PrintKeys => print_keys(&paths).map(|listing| print!("{}", listing)),

        Commands::PrintInfos {
            file,
            keyset,
            np_klicensee,
        } => {
            let overrides = DecodeOverrides {
                keyset,
                klicensee: np_klicensee,
                ..Default::default()
            };
            show_info(&file, &paths, &overrides, cli.raw).map(|info| print!("{}", info))
        }

        Commands::Decrypt {
            input,
            output,
            keyset,
            meta_info,
            np_klicensee,
            threads,
        } => {
            let options = DecryptOptions {
                overrides: DecodeOverrides {
                    keyset,
                    meta_info,
                    klicensee: np_klicensee,
                    threads,
                },
            };
            decrypt_file(&input, &output, &paths, &options).map(|bytes| {
                println!("Decrypted {} bytes to {}", bytes, output.display());
            })
        }

        Commands::Encrypt {
            input,
            output,
            template,
            sce_type,
            compress_data,
            skip_sections,
            key_revision,
            key_policy,
            meta_info,
            keyset,
            self_auth_id,
            self_vendor_id,
            self_type,
            self_app_version,
            self_fw_version,
            self_add_shdrs,
            self_ctrl_flags,
            self_cap_flags,
            self_indiv_seed,
            np_license_type,
            np_app_type,
            np_content_id,
            np_klicensee,
            np_real_fname,
            threads,
        } => {
            let options = EncryptOptions {
                template,
                container_type: sce_type,
                key_revision,
                self_type,
                auth_id: self_auth_id,
                vendor_id: self_vendor_id,
                app_version: self_app_version,
                fw_version: self_fw_version,
                compress: compress_data,
                skip_sections,
                add_section_headers: self_add_shdrs,
                control_flags: self_ctrl_flags,
                capability_flags: self_cap_flags,
                individuals_seed: self_indiv_seed,
                key_policy,
                license_type: np_license_type,
                app_type: np_app_type,
                content_id: np_content_id,
                real_filename: np_real_fname,
                threads,
                keys: KeyOverrides {
                    keyset,
                    meta_info,
                    klicensee: np_klicensee,
                },
            };
            encrypt_file(&input, &output, &paths, &options).map(|bytes| {
                println!("Encrypted {} bytes to {}", bytes, output.display());
            })
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
