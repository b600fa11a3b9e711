//! Narinfo documents: the signed metadata returned with every pull.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::hash::NarHash;
use crate::store_path::StorePath;
use crate::{Error, Result};

/// A narinfo for an uncompressed NAR served from the chunk store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NarInfo {
    pub store_path: StorePath,
    /// Relative download URL.
    pub url: String,
    pub nar_hash: NarHash,
    pub nar_size: u64,
    pub references: Vec<StorePath>,
    pub deriver: Option<StorePath>,
    pub signatures: Vec<Signature>,
    /// Content-address assertion, e.g. `fixed:r:sha256:...`.
    pub ca: Option<String>,
}

impl NarInfo {
    pub fn new(store_path: StorePath, nar_hash: NarHash, nar_size: u64) -> Self {
        let url = format!("nar/{}.nar", nar_hash.content_hash().to_nix_base32());
        Self {
            store_path,
            url,
            nar_hash,
            nar_size,
            references: Vec::new(),
            deriver: None,
            signatures: Vec::new(),
            ca: None,
        }
    }

    pub fn add_signature(&mut self, signature: Signature) {
        self.signatures.push(signature);
    }

    /// The string Nix signs: `1;<path>;sha256:<nix32>;<size>;<refs>`.
    ///
    /// References are full store paths, sorted and comma separated. The
    /// hash must be nix32, not SRI, or Nix rejects the signature.
    pub fn fingerprint(&self) -> String {
        let mut refs: Vec<String> = self.references.iter().map(StorePath::to_path_string).collect();
        refs.sort();
        format!(
            "1;{};{};{};{}",
            self.store_path,
            self.nar_hash.to_typed(),
            self.nar_size,
            refs.join(",")
        )
    }

    /// Render the `Key: value` text form.
    pub fn to_narinfo_text(&self) -> String {
        use std::fmt::Write;

        let hash = self.nar_hash.to_typed();
        let mut out = String::new();
        // Writing to a String cannot fail.
        let _ = writeln!(out, "StorePath: {}", self.store_path);
        let _ = writeln!(out, "URL: {}", self.url);
        let _ = writeln!(out, "Compression: none");
        let _ = writeln!(out, "FileHash: {hash}");
        let _ = writeln!(out, "FileSize: {}", self.nar_size);
        let _ = writeln!(out, "NarHash: {hash}");
        let _ = writeln!(out, "NarSize: {}", self.nar_size);
        if !self.references.is_empty() {
            let refs: Vec<String> = self.references.iter().map(StorePath::basename).collect();
            let _ = writeln!(out, "References: {}", refs.join(" "));
        }
        if let Some(deriver) = &self.deriver {
            let _ = writeln!(out, "Deriver: {}", deriver.basename());
        }
        if let Some(ca) = &self.ca {
            let _ = writeln!(out, "CA: {ca}");
        }
        for sig in &self.signatures {
            let _ = writeln!(out, "Sig: {sig}");
        }
        out
    }

    /// Parse the text form. Unknown keys are ignored.
    pub fn parse(text: &str) -> Result<Self> {
        let mut store_path = None;
        let mut url = None;
        let mut nar_hash = None;
        let mut nar_size = None;
        let mut references = Vec::new();
        let mut deriver = None;
        let mut signatures = Vec::new();
        let mut ca = None;

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (key, value) = line
                .split_once(": ")
                .ok_or_else(|| Error::NarInfoParse(format!("invalid line: {line}")))?;

            match key {
                "StorePath" => store_path = Some(StorePath::parse(value)?),
                "URL" => url = Some(value.to_string()),
                "Compression" if value != "none" => {
                    return Err(Error::NarInfoParse(format!(
                        "unsupported compression: {value}"
                    )));
                }
                "NarHash" => nar_hash = Some(value.parse::<NarHash>()?),
                "NarSize" => {
                    nar_size = Some(
                        value
                            .parse::<u64>()
                            .map_err(|e| Error::NarInfoParse(format!("invalid NarSize: {e}")))?,
                    )
                }
                "References" => {
                    for r in value.split_whitespace() {
                        references.push(StorePath::from_basename(r).map_err(|e| {
                            Error::NarInfoParse(format!("invalid reference '{r}': {e}"))
                        })?);
                    }
                }
                "Deriver" if value != "unknown-deriver" => {
                    deriver = Some(StorePath::from_basename(value).map_err(|e| {
                        Error::NarInfoParse(format!("invalid deriver '{value}': {e}"))
                    })?);
                }
                "Sig" => signatures.push(Signature::parse(value)?),
                "CA" => ca = Some(value.to_string()),
                _ => {}
            }
        }

        let missing = |field: &str| Error::NarInfoParse(format!("missing {field}"));
        Ok(Self {
            store_path: store_path.ok_or_else(|| missing("StorePath"))?,
            url: url.ok_or_else(|| missing("URL"))?,
            nar_hash: nar_hash.ok_or_else(|| missing("NarHash"))?,
            nar_size: nar_size.ok_or_else(|| missing("NarSize"))?,
            references,
            deriver,
            signatures,
            ca,
        })
    }
}

/// A `keyname:base64sig` signature line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub key_name: String,
    pub signature: String,
}

impl Signature {
    pub fn new(key_name: impl Into<String>, signature: impl Into<String>) -> Self {
        Self {
            key_name: key_name.into(),
            signature: signature.into(),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((name, sig)) if !name.is_empty() && !sig.is_empty() => Ok(Self::new(name, sig)),
            _ => Err(Error::NarInfoParse(format!("invalid signature format: {s}"))),
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key_name, self.signature)
    }
}
