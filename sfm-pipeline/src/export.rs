//! PLY export of a reconstruction for inspection in a point cloud viewer.

use ply_rs::{
    ply::{
        Addable, DefaultElement, ElementDef, Encoding, Ply, Property, PropertyDef, PropertyType,
        ScalarType,
    },
    writer::Writer,
};
use sfm_core::nalgebra::{Point3, Vector3};
use sfm_core::Reconstruction;

const CAMERA_COLOR: [u8; 3] = [255, 0, 255];

/// The size of the exported camera frusta relative to the median camera spacing.
const FRUSTUM_SCALE: f64 = 0.25;

/// Points are colored from green to red as their reprojection error goes from zero to this.
const ERROR_SCALE: f64 = 2.0;

/// Encodes the points and cameras of a reconstruction as an ASCII PLY file.
///
/// Points are colored by reprojection error. Every camera is a pyramid of four triangles
/// pointing along its viewing direction.
pub fn reconstruction_ply(reconstruction: &Reconstruction) -> std::io::Result<Vec<u8>> {
    let mut ply = Ply::<DefaultElement>::new();
    ply.header.encoding = Encoding::Ascii;
    ply.header
        .comments
        .push("Exported from sfm-pipeline".to_string());

    let mut point_element = ElementDef::new("vertex".to_string());
    for name in ["x", "y", "z"] {
        point_element.properties.add(PropertyDef::new(
            name.to_string(),
            PropertyType::Scalar(ScalarType::Double),
        ));
    }
    for name in ["red", "green", "blue"] {
        point_element.properties.add(PropertyDef::new(
            name.to_string(),
            PropertyType::Scalar(ScalarType::UChar),
        ));
    }
    ply.header.elements.add(point_element);
    let mut face_element = ElementDef::new("face".to_string());
    face_element.properties.add(PropertyDef::new(
        "vertex_index".to_string(),
        PropertyType::List(ScalarType::UChar, ScalarType::Int),
    ));
    ply.header.elements.add(face_element);

    let mut faces: Vec<DefaultElement> = vec![];
    let mut vertices: Vec<DefaultElement> = vec![];
    let mut add_vertex = |p: Point3<f64>, [r, g, b]: [u8; 3]| -> usize {
        let pos = vertices.len();
        let mut point = DefaultElement::new();
        point.insert("x".to_string(), Property::Double(p.x));
        point.insert("y".to_string(), Property::Double(p.y));
        point.insert("z".to_string(), Property::Double(p.z));
        point.insert("red".to_string(), Property::UChar(r));
        point.insert("green".to_string(), Property::UChar(g));
        point.insert("blue".to_string(), Property::UChar(b));
        vertices.push(point);
        pos
    };
    let mut add_triangle = |a: usize, b: usize, c: usize| {
        let mut face = DefaultElement::new();
        face.insert(
            "vertex_index".to_string(),
            Property::ListInt(vec![a as i32, b as i32, c as i32]),
        );
        faces.push(face);
    };

    let size = frustum_size(reconstruction);
    for camera in reconstruction.cameras.values() {
        let optical_center = camera.pose.optical_center();
        let forward = camera.pose.forward();
        let up = camera.pose.up();
        let right: Vector3<f64> = forward.cross(&up);
        let center = add_vertex(optical_center, CAMERA_COLOR);
        let [up_right, up_left, down_left, down_right] =
            [(1.0, 1.0), (1.0, -1.0), (-1.0, -1.0), (-1.0, 1.0)].map(|(u, r): (f64, f64)| {
                add_vertex(
                    optical_center + forward * size + up * (u * size) + right * (r * size),
                    CAMERA_COLOR,
                )
            });
        add_triangle(center, down_right, up_right);
        add_triangle(center, up_right, up_left);
        add_triangle(center, up_left, down_left);
        add_triangle(center, down_left, down_right);
    }

    for point in reconstruction.points.values() {
        add_vertex(point.position, error_color(point.error));
    }

    ply.payload.insert("vertex".to_string(), vertices);
    ply.payload.insert("face".to_string(), faces);

    let mut bytes = vec![];
    Writer::new().write_ply(&mut bytes, &mut ply)?;
    Ok(bytes)
}

fn error_color(error: f64) -> [u8; 3] {
    let t = if error.is_finite() {
        (error / ERROR_SCALE).clamp(0.0, 1.0)
    } else {
        1.0
    };
    [(255.0 * t) as u8, (255.0 * (1.0 - t)) as u8, 0]
}

/// A frustum size proportional to the median distance between consecutive cameras.
fn frustum_size(reconstruction: &Reconstruction) -> f64 {
    let centers: Vec<Point3<f64>> = reconstruction
        .cameras
        .values()
        .map(|camera| camera.pose.optical_center())
        .collect();
    let mut spacing: Vec<f64> = centers
        .windows(2)
        .map(|w| (w[1] - w[0]).norm())
        .filter(|d| d.is_finite() && *d > 0.0)
        .collect();
    if spacing.is_empty() {
        return FRUSTUM_SCALE;
    }
    spacing.sort_by(|a, b| a.total_cmp(b));
    spacing[spacing.len() / 2] * FRUSTUM_SCALE
}
