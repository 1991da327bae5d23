//! Page categories and per-paper tallies.

use std::{fmt, str::FromStr};

use schemars::JsonSchema;

use crate::prelude::*;

/// The visual category of a single page image.
///
/// The declaration order is significant: it is the column order of every CSV
/// we write, and the default output order of models we train.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum Category {
    /// Western blots and similar gel images.
    Blot,
    /// Electron microscopy.
    EM,
    /// Medical imaging (X-ray, CT, MRI, ultrasound).
    Medical,
    /// Light microscopy.
    MicroPhoto,
    /// Figures that fit nowhere else, mostly charts and diagrams.
    Other,
    /// Regular photographs.
    Photo,
    /// Pages that are only text.
    Text,
}

impl Category {
    /// All categories, in column order.
    pub const ALL: [Category; 7] = [
        Category::Blot,
        Category::EM,
        Category::Medical,
        Category::MicroPhoto,
        Category::Other,
        Category::Photo,
        Category::Text,
    ];

    /// The name used in CSV headers and label files.
    pub fn name(self) -> &'static str {
        match self {
            Category::Blot => "Blot",
            Category::EM => "EM",
            Category::Medical => "Medical",
            Category::MicroPhoto => "MicroPhoto",
            Category::Other => "Other",
            Category::Photo => "Photo",
            Category::Text => "Text",
        }
    }

    /// Our position in [`Category::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Category {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Category::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| {
                anyhow!(
                    "unknown category {:?} (expected one of: {})",
                    s,
                    Category::ALL.map(|c| c.name()).join(", ")
                )
            })
    }
}

/// How many pages of a paper were assigned each category.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CategoryCounts {
    counts: [usize; Category::ALL.len()],
}

impl CategoryCounts {
    /// Tally a sequence of per-page label sets.
    ///
    /// A page with several labels counts once toward each of them.
    pub fn tally<'a, I>(pages: I) -> Self
    where
        I: IntoIterator<Item = &'a [Category]>,
    {
        let mut counts = Self::default();
        for labels in pages {
            for category in Category::ALL {
                if labels.contains(&category) {
                    counts.counts[category.index()] += 1;
                }
            }
        }
        counts
    }

    /// The count for a single category.
    pub fn get(&self, category: Category) -> usize {
        self.counts[category.index()]
    }
}
