//! Discovery of scenes and images under the data directory.
//!
//! Two layouts are understood:
//!
//! * `<data>/<mode>/<dataset>/<scene>/images/*`, where `<mode>` is `train` or `test`.
//! * `<data>/<scene>/images/*`, a flat layout without datasets.
//!
//! A scene directory may contain an `intrinsics.json` mapping image names to known intrinsics.

use crate::{PipelineError, SceneError};
use log::*;
use serde::{Deserialize, Serialize};
use sfm_core::{CameraIntrinsics, ImageId, ImageInfo, Pose, Reconstruction};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tif", "tiff", "webp"];

/// Which split of the data directory is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Train,
    Eval,
}

impl Mode {
    /// The directory of the split under the data directory.
    pub fn directory(self) -> &'static str {
        match self {
            Mode::Train => "train",
            Mode::Eval => "test",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Train => "train",
            Mode::Eval => "eval",
        })
    }
}

impl FromStr for Mode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(Mode::Train),
            "eval" | "test" => Ok(Mode::Eval),
            _ => Err(PipelineError::Config(format!(
                "mode must be train or eval, not {:?}",
                s
            ))),
        }
    }
}

/// Where the images of one scene are.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SceneSource {
    /// Empty in the flat layout.
    pub dataset: String,
    pub name: String,
    pub image_dir: PathBuf,
    pub intrinsics_path: PathBuf,
}

impl SceneSource {
    fn new(dataset: String, name: String, scene_dir: &Path) -> Self {
        Self {
            dataset,
            name,
            image_dir: scene_dir.join("images"),
            intrinsics_path: scene_dir.join("intrinsics.json"),
        }
    }

    /// `<dataset>/<scene>`, or only the scene name in the flat layout.
    pub fn key(&self) -> String {
        if self.dataset.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.dataset, self.name)
        }
    }

    /// The output directory of the scene under `output_dir`.
    pub fn output_dir(&self, output_dir: &Path) -> PathBuf {
        if self.dataset.is_empty() {
            output_dir.join(&self.name)
        } else {
            output_dir.join(&self.dataset).join(&self.name)
        }
    }

    /// Whether a skip-list entry names this scene, by scene name or by key.
    pub fn matches(&self, entry: &str) -> bool {
        let entry = entry.trim_matches('/');
        entry == self.name || entry == self.key()
    }
}

/// Lists every scene of the split, sorted by key.
pub fn discover_scenes(data_dir: &Path, mode: Mode) -> Result<Vec<SceneSource>, PipelineError> {
    let split = data_dir.join(mode.directory());
    let root = if split.is_dir() {
        split
    } else {
        data_dir.to_path_buf()
    };
    let data_root_error = |source| PipelineError::DataRoot {
        path: root.clone(),
        source,
    };

    let mut scenes = vec![];
    for (name, dir) in subdirectories(&root).map_err(data_root_error)? {
        if dir.join("images").is_dir() {
            scenes.push(SceneSource::new(String::new(), name, &dir));
            continue;
        }
        for (scene, scene_dir) in subdirectories(&dir).map_err(data_root_error)? {
            if scene_dir.join("images").is_dir() {
                scenes.push(SceneSource::new(name.clone(), scene, &scene_dir));
            }
        }
    }
    scenes.sort();
    info!("found {} scenes under {}", scenes.len(), root.display());
    Ok(scenes)
}

fn subdirectories(dir: &Path) -> std::io::Result<Vec<(String, PathBuf)>> {
    let mut dirs = vec![];
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            dirs.push((entry.file_name().to_string_lossy().into_owned(), path));
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// The image file names of a scene sorted by name, which is also their id order.
pub fn list_images(image_dir: &Path) -> Result<Vec<String>, SceneError> {
    let mut names = vec![];
    for entry in fs::read_dir(image_dir)? {
        let path = entry?.path();
        let is_image = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .map_or(false, |ext| IMAGE_EXTENSIONS.contains(&ext.as_str()));
        if path.is_file() && is_image {
            if let Some(name) = path.file_name() {
                names.push(name.to_string_lossy().into_owned());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Loads the static information of every image of a scene.
///
/// The dimensions are read from the image header only. Images whose header cannot be read get
/// zero dimensions here and fail later during extraction, where the failure is reported.
pub fn load_images(source: &SceneSource, shared_camera: bool) -> Result<Vec<ImageInfo>, SceneError> {
    let known = read_intrinsics(&source.intrinsics_path);
    let mut images: Vec<ImageInfo> = list_images(&source.image_dir)?
        .into_iter()
        .enumerate()
        .map(|(ix, name)| {
            let (width, height) = match image::image_dimensions(source.image_dir.join(&name)) {
                Ok(dimensions) => dimensions,
                Err(e) => {
                    debug!("unable to read the header of {}: {}", name, e);
                    (0, 0)
                }
            };
            ImageInfo {
                id: ImageId(ix as u32),
                known_intrinsics: known.get(&name).copied(),
                name,
                width,
                height,
            }
        })
        .collect();

    if shared_camera {
        let shared = images
            .iter()
            .find(|info| info.known_intrinsics.is_some() || info.width > 0)
            .map(ImageInfo::intrinsics);
        if let Some(shared) = shared {
            for info in &mut images {
                info.known_intrinsics = Some(shared);
            }
        }
    }
    Ok(images)
}

fn read_intrinsics(path: &Path) -> BTreeMap<String, CameraIntrinsics> {
    if !path.exists() {
        return BTreeMap::new();
    }
    match crate::persist::read_json(path) {
        Ok(known) => known,
        Err(e) => {
            warn!("ignoring unreadable intrinsics {}: {}", path.display(), e);
            BTreeMap::new()
        }
    }
}

/// The header of the submission file.
pub const SUBMISSION_HEADER: &str = "image_path,dataset,scene,rotation_matrix,translation_vector";

/// One submission row per registered image, with the row-major rotation and the translation of
/// the world to camera pose separated by semicolons.
pub fn submission_rows(source: &SceneSource, reconstruction: &Reconstruction) -> Vec<String> {
    reconstruction
        .cameras
        .iter()
        .filter_map(|(&image, camera)| {
            let info = reconstruction.image(image)?;
            let isometry = camera.pose.isometry();
            let rotation = isometry.rotation.matrix();
            let rotation: Vec<String> = (0..3)
                .flat_map(|r| (0..3).map(move |c| (r, c)))
                .map(|(r, c)| format!("{:e}", rotation[(r, c)]))
                .collect();
            let translation: Vec<String> = isometry
                .translation
                .vector
                .iter()
                .map(|t| format!("{:e}", t))
                .collect();
            let image_path = if source.dataset.is_empty() {
                format!("{}/images/{}", source.name, info.name)
            } else {
                format!("{}/{}/images/{}", source.dataset, source.name, info.name)
            };
            Some(format!(
                "{},{},{},{},{}",
                image_path,
                source.dataset,
                source.name,
                rotation.join(";"),
                translation.join(";")
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch_scene(dir: &Path, images: &[&str]) {
        fs::create_dir_all(dir.join("images")).unwrap();
        for name in images {
            fs::write(dir.join("images").join(name), b"").unwrap();
        }
    }

    #[test]
    fn discovers_nested_and_flat_scenes() {
        let dir = tempfile::tempdir().unwrap();
        touch_scene(&dir.path().join("test/heritage/dioscuri"), &["a.png"]);
        touch_scene(&dir.path().join("test/haiper/bike"), &["a.png"]);
        fs::create_dir_all(dir.path().join("test/haiper/notes")).unwrap();
        let scenes = discover_scenes(dir.path(), Mode::Eval).unwrap();
        let keys: Vec<String> = scenes.iter().map(SceneSource::key).collect();
        assert_eq!(keys, vec!["haiper/bike", "heritage/dioscuri"]);
        assert!(scenes[0].matches("bike"));
        assert!(scenes[0].matches("haiper/bike"));
        assert!(!scenes[0].matches("haiper"));

        let flat = tempfile::tempdir().unwrap();
        touch_scene(&flat.path().join("courtyard"), &["a.png"]);
        let scenes = discover_scenes(flat.path(), Mode::Train).unwrap();
        assert_eq!(scenes.len(), 1);
        assert_eq!(scenes[0].key(), "courtyard");
        assert_eq!(scenes[0].output_dir(Path::new("out")), Path::new("out/courtyard"));
    }

    #[test]
    fn images_are_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        touch_scene(dir.path(), &["b.JPG", "a.png", "notes.txt"]);
        assert_eq!(list_images(&dir.path().join("images")).unwrap(), vec!["a.png", "b.JPG"]);
    }

    #[test]
    fn known_and_shared_intrinsics() {
        let dir = tempfile::tempdir().unwrap();
        touch_scene(dir.path(), &[]);
        image::GrayImage::new(40, 30)
            .save(dir.path().join("images/a.png"))
            .unwrap();
        image::GrayImage::new(80, 60)
            .save(dir.path().join("images/b.png"))
            .unwrap();
        fs::write(
            dir.path().join("intrinsics.json"),
            r#"{ "b.png": { "fx": 100.0, "fy": 100.0, "cx": 40.0, "cy": 30.0 } }"#,
        )
        .unwrap();
        let source = SceneSource::new(String::new(), "scene".to_string(), dir.path());

        let images = load_images(&source, false).unwrap();
        assert_eq!((images[0].width, images[0].height), (40, 30));
        assert_eq!(images[0].known_intrinsics, None);
        assert_eq!(images[1].known_intrinsics.map(|k| k.fx), Some(100.0));

        let shared = load_images(&source, true).unwrap();
        assert_eq!(shared[0].known_intrinsics, shared[1].known_intrinsics);
        assert_eq!(shared[1].intrinsics(), CameraIntrinsics::estimated(40, 30));
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert_eq!("eval".parse::<Mode>().unwrap(), Mode::Eval);
        assert!("validate".parse::<Mode>().is_err());
    }
}
