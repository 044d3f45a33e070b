//! Path handling for virtual model resources
//!
//! PMX files reference textures with whatever casing the author happened to
//! type, and the archive stores folders with whatever casing the packer used.
//! This module handles:
//! - Canonical lookup keys for archive entries and requested resources
//! - Building the virtual URL a model loader requests

/// First path segment reserved for requests served from the loaded archive.
pub const VIRTUAL_FOLDER_MARKER: &str = "__mmd_previewer_resource__";

/// Suffix identifying the model descriptor inside an archive.
pub const DESCRIPTOR_SUFFIX: &str = ".pmx";

/// Normalize a path for lookups and comparisons.
///
/// Percent-decodes exactly once (the model loader encodes each component
/// before issuing a request), then lowercases. Malformed escapes are kept
/// as literal text and invalid UTF-8 is replaced, so this never fails.
pub fn normalize(path: &str) -> String {
    let decoded = urlencoding::decode_binary(path.as_bytes());
    String::from_utf8_lossy(&decoded).to_lowercase()
}

/// Build the request path for an archive entry under the virtual folder.
///
/// `Textures/肌.png` -> `/__mmd_previewer_resource__/Textures/%E8%82%8C.png`
pub fn virtual_url(stored_path: &str) -> String {
    let encoded: Vec<String> = stored_path
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    format!("/{}/{}", VIRTUAL_FOLDER_MARKER, encoded.join("/"))
}

/// Check whether a normalized path names a model descriptor
pub fn is_descriptor(normalized: &str) -> bool {
    normalized.ends_with(DESCRIPTOR_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("Tex/Body.PNG"), "tex/body.png");
        assert_eq!(normalize("tex%2Fbody.png"), "tex/body.png");
        assert_eq!(normalize("%E8%82%8C.png"), "肌.png");
        assert_eq!(normalize("%E3%83%86%E3%82%AF%E3%82%B9%E3%83%81%E3%83%A3/A.bmp"), "テクスチャ/a.bmp");
    }

    #[test]
    fn test_normalize_keeps_everything_else() {
        // No trimming, no separator rewriting
        assert_eq!(normalize(" /Model\\Tex/ "), " /model\\tex/ ");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn test_normalize_decodes_once() {
        assert_eq!(normalize("a%2541.png"), "a%41.png");
    }

    #[test]
    fn test_normalize_malformed_escape() {
        assert_eq!(normalize("100%.png"), "100%.png");
        assert_eq!(normalize("bad%zz.PNG"), "bad%zz.png");
    }

    #[test]
    fn test_normalize_idempotent() {
        let samples = [
            "Model.pmx",
            "TEX/Skin.png",
            "%E8%82%8C/Hair.TGA",
            "sph/Metal%20Ball.sph",
            "toon/toon01.bmp",
            "100%.png",
            "",
        ];
        for sample in samples {
            let once = normalize(sample);
            assert_eq!(normalize(&once), once, "not idempotent for {:?}", sample);
        }
    }

    #[test]
    fn test_case_and_escape_variants_match() {
        assert_eq!(normalize("A/b.txt"), normalize("a/B.TXT"));
        assert_eq!(normalize("tex/%E8%82%8C.png"), normalize("Tex/肌.PNG"));
        assert_ne!(normalize("tex/a.png"), normalize("tex/b.png"));
    }

    #[test]
    fn test_virtual_url() {
        assert_eq!(virtual_url("model.pmx"), "/__mmd_previewer_resource__/model.pmx");
        assert_eq!(
            virtual_url("Miku V2/model 1.pmx"),
            "/__mmd_previewer_resource__/Miku%20V2/model%201.pmx"
        );
    }

    #[test]
    fn test_virtual_url_round_trips_through_normalize() {
        let url = virtual_url("Tex/肌.png");
        let resource = url
            .strip_prefix(&format!("/{}/", VIRTUAL_FOLDER_MARKER))
            .unwrap();
        assert_eq!(normalize(resource), "tex/肌.png");
    }

    #[test]
    fn test_is_descriptor() {
        assert!(is_descriptor("model.pmx"));
        assert!(!is_descriptor("model.pmx.bak"));
        assert!(!is_descriptor("tex/body.png"));
    }
}
