use lazy_static::lazy_static;
use log::{debug, info};
use regex::Regex;
use simple_error::bail;
use std::error::Error;
use std::io::Write;
use std::path::Path;

/// Parses a crop specification of the form WIDTHxHEIGHT+XOFF+YOFF.
///
/// Example: "500x500+1600+1000" selects a 500-square window whose top-left
/// corner sits 1600 samples in and 1000 rows down.
pub fn parse_crop_spec(spec: &str) -> Result<pds::CropRegion, Box<dyn Error>> {
    lazy_static! {
        static ref CROP_RE: Regex = Regex::new(r"^(\d+)x(\d+)\+(\d+)\+(\d+)$").unwrap();
    }
    let captures = match CROP_RE.captures(spec) {
        Some(captures) => captures,
        None => bail!("invalid crop spec {:?}; expected WIDTHxHEIGHT+XOFF+YOFF", spec),
    };
    Ok(pds::CropRegion {
        width: captures[1].parse()?,
        height: captures[2].parse()?,
        x_offset: captures[3].parse()?,
        y_offset: captures[4].parse()?,
    })
}

/// Writes the mesh as a Wavefront OBJ file with quad faces.
pub fn mesh_to_obj<P: AsRef<Path>>(mesh: &pds::Mesh, path: P) -> Result<(), Box<dyn Error>> {
    let mut out = std::io::BufWriter::new(std::fs::File::create(path.as_ref())?);
    writeln!(out, "o {}", mesh.name)?;
    for v in &mesh.vertices {
        writeln!(out, "v {} {} {}", v[0], v[1], v[2])?;
    }
    // OBJ vertex indices count from 1.
    for face in &mesh.faces {
        writeln!(
            out,
            "f {} {} {} {}",
            face[0] + 1,
            face[1] + 1,
            face[2] + 1,
            face[3] + 1
        )?;
    }
    out.flush()?;
    info!(
        "wrote {} vertices and {} faces to {}",
        mesh.vertices.len(),
        mesh.faces.len(),
        path.as_ref().display()
    );
    Ok(())
}

/// Renders a row stream as a shaded elevation preview PNG.
///
/// Missing samples render black; valid samples ramp through green with a
/// blue contour stripe. This materializes the stream, so it is a preview
/// aid for (usually binned) images rather than part of the streaming core.
pub fn rows_to_png<P: AsRef<Path>>(stream: pds::RowStream, path: P) -> Result<(), Box<dyn Error>> {
    let (geometry, rows) = stream.collect_rows()?;
    if geometry.width == 0 || geometry.height == 0 {
        bail!("image has no pixels to render");
    }

    let mut min = f64::MAX;
    let mut max = f64::MIN;
    for row in &rows {
        for v in row.iter().flatten() {
            min = min.min(*v);
            max = max.max(*v);
        }
    }
    if min > max {
        bail!("image has no valid samples to render");
    }
    let range = (max - min).max(f64::EPSILON);
    debug!("preview range: {} .. {}", min, max);

    let mut img = image::ImageBuffer::new(geometry.width, geometry.height);
    for (y, row) in rows.iter().enumerate() {
        for (x, v) in row.iter().enumerate() {
            img[(x as u32, y as u32)] = match v {
                None => image::Rgb([0u8, 0, 0]),
                Some(v) => {
                    let frac = ((v - min) / range) as f32;
                    let stripe = frac * 256.0 - ((frac * 256.0) as i32) as f32;
                    let green: u8 = (frac * 255.0) as u8;
                    let blue: u8 = (stripe * 256.0) as u8;
                    image::Rgb([0, green, blue])
                }
            };
        }
    }
    img.save(path.as_ref())?;
    info!(
        "wrote {}x{} preview to {}",
        geometry.width,
        geometry.height,
        path.as_ref().display()
    );
    Ok(())
}
