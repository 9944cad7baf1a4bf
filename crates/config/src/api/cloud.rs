use serde::{Deserialize, Serialize};

/// Names of the supported Azure clouds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CloudName {
    #[default]
    AzurePublic,
    AzureGovernment,
    AzureChina,
}

impl std::fmt::Display for CloudName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AzurePublic => write!(f, "AzurePublic"),
            Self::AzureGovernment => write!(f, "AzureGovernment"),
            Self::AzureChina => write!(f, "AzureChina"),
        }
    }
}

/// Selects the Azure cloud instance a shoot or bucket lives in.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CloudConfiguration {
    pub name: CloudName,
}

impl CloudConfiguration {
    /// Resolves the cloud for a region.
    ///
    /// An explicit configuration wins. Without one, sovereign regions are
    /// recognized by prefix (`usgov`, `usdod`, `ussec` for government,
    /// `china` for China); everything else is the public cloud.
    #[must_use]
    pub fn resolve(configuration: Option<&Self>, region: &str) -> CloudName {
        if let Some(configuration) = configuration {
            return configuration.name;
        }

        let region = region.to_ascii_lowercase();
        if ["usgov", "usdod", "ussec"]
            .iter()
            .any(|prefix| region.starts_with(prefix))
        {
            CloudName::AzureGovernment
        } else if region.starts_with("china") {
            CloudName::AzureChina
        } else {
            CloudName::AzurePublic
        }
    }
}
