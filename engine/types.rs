// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

/// `Chr<chr>(<assembly>):g.<position><reference>><alternate>`
static VARIANT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+)\(.+:g\.(\d+)(.+)>(.+)$").expect("variant pattern is a valid regex")
});

/// `<reference><position><alternate>`, residue codes are one or more non-digit characters.
static CHANGE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\D+)(\d+)(\D+)$").expect("change pattern is a valid regex")
});

/// Malformed identifiers. These indicate bad input rather than expected missing data,
/// so they are always reported to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Variant '{0}' does not match the expected 'Chr<chr>(<assembly>):g.<pos><ref>><alt>' notation.")]
    InvalidVariant(String),
    #[error("Mutation '{0}' is not of the form '<isoform>:<change>'.")]
    MissingSeparator(String),
    #[error("Change '{0}' is not of the form '<ref><position><alt>'.")]
    InvalidChange(String),
}

/// A chromosomal variant as parsed from the sample metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenomicMutation {
    pub chromosome: String,
    pub position: u64,
    pub reference: String,
    pub alternate: String,
}

impl GenomicMutation {
    pub fn parse_variant(variant: &str) -> Result<Self, ParseError> {
        let invalid = || ParseError::InvalidVariant(variant.to_string());
        let captures = VARIANT_PATTERN.captures(variant.trim()).ok_or_else(invalid)?;

        let chromosome = captures[1].trim();
        let chromosome = chromosome.strip_prefix("Chr").unwrap_or(chromosome);
        let position = captures[2].parse::<u64>().map_err(|_| invalid())?;

        Ok(Self {
            chromosome: chromosome.to_string(),
            position,
            reference: captures[3].to_string(),
            alternate: captures[4].to_string(),
        })
    }

    /// The `<chr>:<pos>:<alt>` key understood by the isoform-mutation generator.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for GenomicMutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.chromosome, self.position, self.alternate)
    }
}

/// A residue substitution such as `A10G`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AminoAcidChange {
    pub reference: String,
    pub position: u32,
    pub alternate: String,
}

impl AminoAcidChange {
    pub fn parse(change: &str) -> Result<Self, ParseError> {
        let invalid = || ParseError::InvalidChange(change.to_string());
        let captures = CHANGE_PATTERN.captures(change).ok_or_else(invalid)?;
        Ok(Self {
            reference: captures[1].to_string(),
            position: captures[2].parse::<u32>().map_err(|_| invalid())?,
            alternate: captures[3].to_string(),
        })
    }
}

impl fmt::Display for AminoAcidChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.reference, self.position, self.alternate)
    }
}

/// `<protein-isoform-id>:<amino-acid-change>`, the join key shared by both predictor sources.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IsoformMutation {
    pub isoform: String,
    pub change: AminoAcidChange,
}

impl IsoformMutation {
    pub fn parse(id: &str) -> Result<Self, ParseError> {
        let (isoform, change) = id
            .split_once(':')
            .ok_or_else(|| ParseError::MissingSeparator(id.to_string()))?;
        if isoform.is_empty() {
            return Err(ParseError::MissingSeparator(id.to_string()));
        }
        Ok(Self {
            isoform: isoform.to_string(),
            change: AminoAcidChange::parse(change)?,
        })
    }
}

impl fmt::Display for IsoformMutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.isoform, self.change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_variant_strips_chr_prefix_and_keys_without_reference() {
        let mutation = GenomicMutation::parse_variant("Chr17(GRCh37):g.41245466G>A").unwrap();
        assert_eq!(mutation.chromosome, "17");
        assert_eq!(mutation.position, 41245466);
        assert_eq!(mutation.reference, "G");
        assert_eq!(mutation.alternate, "A");
        assert_eq!(mutation.key(), "17:41245466:A");
    }

    #[test]
    fn parse_variant_rejects_free_text() {
        assert_eq!(
            GenomicMutation::parse_variant("not a variant"),
            Err(ParseError::InvalidVariant("not a variant".to_string()))
        );
    }

    #[test]
    fn change_accepts_multi_character_residues() {
        let change = AminoAcidChange::parse("Arg123Ter").unwrap();
        assert_eq!(change.reference, "Arg");
        assert_eq!(change.position, 123);
        assert_eq!(change.alternate, "Ter");

        let single = AminoAcidChange::parse("X3Z").unwrap();
        assert_eq!(single.to_string(), "X3Z");
    }

    #[test]
    fn change_rejects_missing_position_or_residue() {
        assert!(AminoAcidChange::parse("AG").is_err());
        assert!(AminoAcidChange::parse("10G").is_err());
        assert!(AminoAcidChange::parse("A10").is_err());
    }

    #[test]
    fn isoform_mutation_requires_separator() {
        let parsed = IsoformMutation::parse("ENSP0001:A10G").unwrap();
        assert_eq!(parsed.isoform, "ENSP0001");
        assert_eq!(parsed.to_string(), "ENSP0001:A10G");
        assert_eq!(
            IsoformMutation::parse("ENSP0001A10G"),
            Err(ParseError::MissingSeparator("ENSP0001A10G".to_string()))
        );
    }
}
