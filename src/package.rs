//! Product, dependency, property and state types

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::version::Condition;

/// Priority bounds accepted for a product
pub const MIN_PRIORITY: i32 = -100;
pub const MAX_PRIORITY: i32 = 100;

/// Kind of product
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductType {
    Localboot,
    Netboot,
    Server,
}

impl fmt::Display for ProductType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProductType::Localboot => write!(f, "localboot"),
            ProductType::Netboot => write!(f, "netboot"),
            ProductType::Server => write!(f, "server"),
        }
    }
}

impl FromStr for ProductType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "localboot" | "localbootproduct" => Ok(ProductType::Localboot),
            "netboot" | "netbootproduct" => Ok(ProductType::Netboot),
            "server" | "serverproduct" => Ok(ProductType::Server),
            _ => Err(format!("Unknown product type: {}", s)),
        }
    }
}

/// Relative script filenames, resolved under the client-data directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scripts {
    pub setup: Option<String>,
    pub uninstall: Option<String>,
    pub update: Option<String>,
    pub always: Option<String>,
    pub once: Option<String>,
    pub custom: Option<String>,
    pub user_login: Option<String>,
}

/// A product version on the depot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub product_type: ProductType,

    pub id: String,

    pub product_version: String,

    pub package_version: String,

    pub name: String,

    /// Higher runs first
    pub priority: i32,

    pub description: String,

    pub advice: String,

    pub license_required: bool,

    #[serde(default)]
    pub scripts: Scripts,

    #[serde(default)]
    pub product_class_ids: Vec<String>,

    #[serde(default)]
    pub windows_software_ids: Vec<String>,

    /// Only meaningful for netboot products
    #[serde(default)]
    pub pxe_config_template: Option<String>,
}

impl Product {
    /// Create a product with defaults for everything but its identity
    pub fn new(
        product_type: ProductType,
        id: &str,
        product_version: &str,
        package_version: &str,
    ) -> Self {
        Self {
            product_type,
            id: id.to_string(),
            product_version: product_version.to_string(),
            package_version: package_version.to_string(),
            name: id.to_string(),
            priority: 0,
            description: String::new(),
            advice: String::new(),
            license_required: false,
            scripts: Scripts::default(),
            product_class_ids: Vec::new(),
            windows_software_ids: Vec::new(),
            pxe_config_template: None,
        }
    }

    /// Get the full version string
    pub fn full_version(&self) -> String {
        format!("{}-{}", self.product_version, self.package_version)
    }

    pub fn key(&self) -> ProductKey {
        ProductKey {
            product_id: self.id.clone(),
            product_version: self.product_version.clone(),
            package_version: self.package_version.clone(),
        }
    }
}

/// The real identity of a product version
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProductKey {
    pub product_id: String,
    pub product_version: String,
    pub package_version: String,
}

impl fmt::Display for ProductKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}-{}",
            self.product_id, self.product_version, self.package_version
        )
    }
}

/// Operation a host should perform for a product
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionRequest {
    #[default]
    None,
    Setup,
    Uninstall,
    Update,
    Once,
    Always,
    Undefined,
}

impl ActionRequest {
    /// `none` and `undefined` request nothing
    pub fn is_pending(self) -> bool {
        !matches!(self, ActionRequest::None | ActionRequest::Undefined)
    }
}

impl fmt::Display for ActionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionRequest::None => "none",
            ActionRequest::Setup => "setup",
            ActionRequest::Uninstall => "uninstall",
            ActionRequest::Update => "update",
            ActionRequest::Once => "once",
            ActionRequest::Always => "always",
            ActionRequest::Undefined => "undefined",
        };
        f.write_str(s)
    }
}

impl FromStr for ActionRequest {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "" => Ok(ActionRequest::None),
            "setup" => Ok(ActionRequest::Setup),
            "uninstall" => Ok(ActionRequest::Uninstall),
            "update" => Ok(ActionRequest::Update),
            "once" => Ok(ActionRequest::Once),
            "always" => Ok(ActionRequest::Always),
            "undefined" => Ok(ActionRequest::Undefined),
            _ => Err(format!("Unknown action request: {}", s)),
        }
    }
}

/// Observed installation state of a product on a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallationStatus {
    #[default]
    NotInstalled,
    Installed,
    Installing,
    Failed,
    Unknown,
}

impl fmt::Display for InstallationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstallationStatus::NotInstalled => "not_installed",
            InstallationStatus::Installed => "installed",
            InstallationStatus::Installing => "installing",
            InstallationStatus::Failed => "failed",
            InstallationStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl FromStr for InstallationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "not_installed" | "not installed" => Ok(InstallationStatus::NotInstalled),
            "installed" => Ok(InstallationStatus::Installed),
            "installing" => Ok(InstallationStatus::Installing),
            "failed" => Ok(InstallationStatus::Failed),
            "unknown" => Ok(InstallationStatus::Unknown),
            _ => Err(format!("Unknown installation status: {}", s)),
        }
    }
}

/// What a dependency points at
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyTarget {
    Product(String),
    ProductClass(String),
}

/// What the dependency must reach
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Requirement {
    Action(ActionRequest),
    Status(InstallationStatus),
}

/// Relative position of the required product in the sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementType {
    /// Required product runs before the dependent
    Before,
    /// Required product runs after the dependent
    After,
}

impl fmt::Display for RequirementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequirementType::Before => write!(f, "before"),
            RequirementType::After => write!(f, "after"),
        }
    }
}

impl FromStr for RequirementType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "before" => Ok(RequirementType::Before),
            "after" => Ok(RequirementType::After),
            _ => Err(format!("Unknown requirement type: {}", s)),
        }
    }
}

/// A declared action dependency between products
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductDependency {
    pub product_id: String,
    pub product_version: String,
    pub package_version: String,

    /// Action of the dependent product this edge applies to
    pub action: ActionRequest,

    pub target: DependencyTarget,

    pub requirement: Requirement,

    #[serde(default)]
    pub requirement_type: Option<RequirementType>,
}

/// Typed shape of a product property
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PropertyKind {
    Unicode {
        possible_values: Vec<String>,
        default_values: Vec<String>,
        editable: bool,
        multi_value: bool,
    },
    Bool {
        default: bool,
    },
}

/// A configurable property of a product
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductProperty {
    pub product_id: String,
    pub product_version: String,
    pub package_version: String,
    pub name: String,
    pub description: String,
    pub kind: PropertyKind,
}

impl ProductProperty {
    /// Possible values; fixed for bool properties
    pub fn possible_values(&self) -> Vec<String> {
        match &self.kind {
            PropertyKind::Unicode {
                possible_values, ..
            } => possible_values.clone(),
            PropertyKind::Bool { .. } => vec!["true".to_string(), "false".to_string()],
        }
    }

    pub fn default_values(&self) -> Vec<String> {
        match &self.kind {
            PropertyKind::Unicode { default_values, .. } => default_values.clone(),
            PropertyKind::Bool { default } => vec![default.to_string()],
        }
    }

    /// Check that `values` could be the defaults of this property
    pub fn validate_defaults(&self, values: &[String]) -> Result<(), String> {
        match &self.kind {
            PropertyKind::Bool { .. } => match values {
                [v] if v == "true" || v == "false" => Ok(()),
                _ => Err(format!(
                    "bool property '{}' needs exactly one of true/false",
                    self.name
                )),
            },
            PropertyKind::Unicode {
                possible_values,
                multi_value,
                ..
            } => {
                if !multi_value && values.len() > 1 {
                    return Err(format!(
                        "property '{}' is not multi-value but has {} defaults",
                        self.name,
                        values.len()
                    ));
                }
                if possible_values.is_empty() {
                    return Ok(());
                }
                match values.iter().find(|v| !possible_values.contains(v)) {
                    Some(bad) => Err(format!(
                        "default '{}' of property '{}' is not a possible value",
                        bad, self.name
                    )),
                    None => Ok(()),
                }
            }
        }
    }

    /// Replace the default values after validating them
    pub fn set_defaults(&mut self, values: Vec<String>) -> Result<(), String> {
        self.validate_defaults(&values)?;
        match &mut self.kind {
            PropertyKind::Bool { default } => *default = values[0] == "true",
            PropertyKind::Unicode { default_values, .. } => *default_values = values,
        }
        Ok(())
    }
}

/// Build-time dependency of a package on another installed package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDependency {
    pub package: String,
    #[serde(default)]
    pub condition: Option<Condition>,
}

impl fmt::Display for PackageDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.condition {
            Some(condition) => write!(f, "{} ({})", self.package, condition),
            None => write!(f, "{}", self.package),
        }
    }
}

impl FromStr for PackageDependency {
    type Err = String;

    /// Parse `name`, `name (>= 1.0)` or `name >= 1.0`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| c.is_whitespace() || matches!(c, '(' | '<' | '>' | '='))
            .unwrap_or(s.len());
        let (package, rest) = s.split_at(split);
        if package.is_empty() {
            return Err(format!("Missing package name in dependency: {}", s));
        }

        let rest = rest.trim();
        let condition = if rest.is_empty() {
            None
        } else {
            Some(rest.parse::<Condition>().map_err(|e| e.to_string())?)
        };

        Ok(PackageDependency {
            package: package.to_string(),
            condition,
        })
    }
}

/// Installation state and action request of one product on one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductOnClient {
    pub product_id: String,
    pub host_id: String,
    #[serde(default)]
    pub installation_status: InstallationStatus,
    #[serde(default)]
    pub action_request: ActionRequest,
    #[serde(default)]
    pub product_version: Option<String>,
    #[serde(default)]
    pub package_version: Option<String>,
}

impl ProductOnClient {
    pub fn new(product_id: &str, host_id: &str) -> Self {
        Self {
            product_id: product_id.to_string(),
            host_id: host_id.to_string(),
            installation_status: InstallationStatus::NotInstalled,
            action_request: ActionRequest::None,
            product_version: None,
            package_version: None,
        }
    }
}

/// Product version installed on a depot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductOnDepot {
    pub product_id: String,
    pub depot_id: String,
    pub product_version: String,
    pub package_version: String,
    pub product_type: ProductType,
    /// Unix timestamp of installation
    pub install_date: i64,
}

impl ProductOnDepot {
    /// Get the full version string
    pub fn full_version(&self) -> String {
        format!("{}-{}", self.product_version, self.package_version)
    }

    pub fn key(&self) -> ProductKey {
        ProductKey {
            product_id: self.product_id.clone(),
            product_version: self.product_version.clone(),
            package_version: self.package_version.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::Operator;

    #[test]
    fn test_package_dependency_parsing() {
        let dep: PackageDependency = "base-tools (>= 2.0-1)".parse().unwrap();
        assert_eq!(dep.package, "base-tools");
        let cond = dep.condition.unwrap();
        assert_eq!(cond.operator, Operator::Ge);
        assert_eq!(cond.version, "2.0-1");

        let dep: PackageDependency = "hotfix<=201209".parse().unwrap();
        assert_eq!(dep.package, "hotfix");
        assert_eq!(dep.condition.unwrap().operator, Operator::Le);

        let dep: PackageDependency = "plain".parse().unwrap();
        assert!(dep.condition.is_none());
        assert_eq!(dep.to_string(), "plain");
    }

    #[test]
    fn test_property_default_validation() {
        let mut prop = ProductProperty {
            product_id: "p".to_string(),
            product_version: "1.0".to_string(),
            package_version: "1".to_string(),
            name: "lang".to_string(),
            description: String::new(),
            kind: PropertyKind::Unicode {
                possible_values: vec!["de".to_string(), "en".to_string()],
                default_values: vec!["en".to_string()],
                editable: false,
                multi_value: false,
            },
        };

        assert!(prop.set_defaults(vec!["fr".to_string()]).is_err());
        assert!(prop
            .set_defaults(vec!["de".to_string(), "en".to_string()])
            .is_err());
        prop.set_defaults(vec!["de".to_string()]).unwrap();
        assert_eq!(prop.default_values(), vec!["de".to_string()]);
    }

    #[test]
    fn test_action_request_pending() {
        assert!(!ActionRequest::None.is_pending());
        assert!(!ActionRequest::Undefined.is_pending());
        assert!(ActionRequest::Setup.is_pending());
        assert_eq!("Uninstall".parse::<ActionRequest>().unwrap(), ActionRequest::Uninstall);
    }
}
