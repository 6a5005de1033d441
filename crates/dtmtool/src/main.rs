use clap::{arg, command, Command};
use std::error::Error;
use std::path::PathBuf;
use std::str::FromStr;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let matches = command!()
        .propagate_version(true)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(arg!(-v --verbose ... "Increases verbosity by one level (can be repeated)"))
        .arg(
            arg!(--vmodule <FILTER> "sets the env_logger filter to the given string: \
                                     default,module::path=level,... \
                                     {trace,debug,info,warn,error,none}")
            .required(false),
        )
        .subcommand(Command::new("version").about("Print version information"))
        .subcommand(
            Command::new("info")
                .about("prints details about PDS IMG files")
                .arg(arg!(-a - -all "If set, prints the full parsed label too."))
                .arg(arg!([PATTERN]).required(true)),
        )
        .subcommand(
            Command::new("mesh")
                .about("builds a terrain mesh from an IMG file and writes it as OBJ")
                .arg(arg!([INPUT]).required(true).allow_invalid_utf8(true))
                .arg(arg!([OUTPUT]).required(false).allow_invalid_utf8(true))
                .arg(
                    arg!(--bin <MODE> "binning mode: NONE, BIN2, BIN6, BIN6-FAST, BIN12, \
                                       BIN12-FAST")
                    .required(false),
                )
                .arg(arg!(--scale <FACTOR> "uniform scale factor (must be positive)").required(false))
                .arg(
                    arg!(--normalize <HEIGHT> "fit elevations into 0..HEIGHT before scaling")
                        .required(false),
                )
                .arg(arg!(--crop <SPEC> "crop window as WIDTHxHEIGHT+XOFF+YOFF").required(false)),
        )
        .subcommand(
            Command::new("png")
                .about("renders an IMG file as a shaded elevation preview")
                .arg(arg!([INPUT]).required(true).allow_invalid_utf8(true))
                .arg(arg!([OUTPUT]).required(false).allow_invalid_utf8(true))
                .arg(arg!(--bin <MODE> "binning mode, as for mesh").required(false)),
        )
        .get_matches();

    // Logging stuff: keep above everything but the cmdline parsing.
    let mut log_builder = env_logger::Builder::new();
    match matches.occurrences_of("verbose") {
        1 => {
            log_builder.filter_level(log::LevelFilter::Info);
        }
        2 => {
            log_builder.filter_level(log::LevelFilter::Debug);
        }
        3 => {
            log_builder.filter_level(log::LevelFilter::Trace);
        }
        _ => (),
    };
    if let Some(filter) = matches.value_of("vmodule") {
        log_builder.parse_filters(&filter);
    }
    log_builder.init();

    match matches.subcommand() {
        Some(("version", _)) => {
            println!(env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some(("info", sub_matches)) => {
            let pattern = sub_matches.value_of("PATTERN").unwrap();
            for entry in glob::glob(pattern)? {
                let path = entry?;
                let info = pds::ImgFile::open(&path)?;
                if sub_matches.is_present("all") {
                    // verbose
                    println!("{:+}", &info); // Use {:+} for verbose printing.
                } else {
                    println!("{}", &info);
                }
            }
        }
        Some(("mesh", sub_matches)) => {
            let in_path = PathBuf::from(sub_matches.value_of_os("INPUT").unwrap());
            let out_path = match sub_matches.value_of_os("OUTPUT") {
                Some(path) => PathBuf::from(path),
                None => in_path.with_extension("obj"),
            };

            let mut options = pds::ImportOptions::default();
            if let Some(mode) = sub_matches.value_of("bin") {
                options.bin_mode = pds::BinMode::from_str(mode)?;
            }
            if let Some(scale) = sub_matches.value_of("scale") {
                options.scale = scale.parse()?;
            }
            if let Some(height) = sub_matches.value_of("normalize") {
                options.normalize = Some(height.parse()?);
            }
            if let Some(spec) = sub_matches.value_of("crop") {
                options.crop = Some(dtmtool::parse_crop_spec(spec)?);
            }

            let mut img = pds::ImgFile::open(&in_path)?;
            let mesh = img.mesh(&options)?;
            dtmtool::mesh_to_obj(&mesh, &out_path)?;
            println!(
                "Wrote \"{}\" ({} vertices, {} faces) to {:?}",
                mesh.name,
                mesh.vertices.len(),
                mesh.faces.len(),
                &out_path
            );
        }
        Some(("png", sub_matches)) => {
            let in_path = PathBuf::from(sub_matches.value_of_os("INPUT").unwrap());
            let out_path = match sub_matches.value_of_os("OUTPUT") {
                Some(path) => PathBuf::from(path),
                None => in_path.with_extension("png"),
            };
            let bin_mode = match sub_matches.value_of("bin") {
                Some(mode) => pds::BinMode::from_str(mode)?,
                None => pds::BinMode::None,
            };

            let mut img = pds::ImgFile::open(&in_path)?;
            let descriptor = *img.descriptor();
            let stream = img.rows()?.shift_to_origin(&descriptor).bin(bin_mode);
            dtmtool::rows_to_png(stream, &out_path)?;
            println!("Wrote preview to {:?}", &out_path);
        }
        _ => unreachable!(),
    }
    Ok(())
}
