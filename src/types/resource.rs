//! Resource types

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use uuid::Uuid;

/// Kind of bookable resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "resource_type", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    Classroom,
    Laboratory,
    Auditorium,
    MeetingRoom,
    StudyRoom,
    ComputerLab,
    SportsFacility,
    Equipment,
    Vehicle,
    Other,
}

impl ResourceType {
    pub const ALL: [ResourceType; 10] = [
        ResourceType::Classroom,
        ResourceType::Laboratory,
        ResourceType::Auditorium,
        ResourceType::MeetingRoom,
        ResourceType::StudyRoom,
        ResourceType::ComputerLab,
        ResourceType::SportsFacility,
        ResourceType::Equipment,
        ResourceType::Vehicle,
        ResourceType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Classroom => "CLASSROOM",
            ResourceType::Laboratory => "LABORATORY",
            ResourceType::Auditorium => "AUDITORIUM",
            ResourceType::MeetingRoom => "MEETING_ROOM",
            ResourceType::StudyRoom => "STUDY_ROOM",
            ResourceType::ComputerLab => "COMPUTER_LAB",
            ResourceType::SportsFacility => "SPORTS_FACILITY",
            ResourceType::Equipment => "EQUIPMENT",
            ResourceType::Vehicle => "VEHICLE",
            ResourceType::Other => "OTHER",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = String;

    /// Case-insensitive; `-` and spaces are accepted in place of `_`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase().replace(['-', ' '], "_");
        ResourceType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| {
                let known: Vec<&str> = ResourceType::ALL.iter().map(|t| t.as_str()).collect();
                format!("Invalid resource type '{}'. Expected one of: {}", s.trim(), known.join(", "))
            })
    }
}

/// Operational status of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "resource_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceStatus {
    Available,
    Reserved,
    Maintenance,
    OutOfService,
}

impl Default for ResourceStatus {
    fn default() -> Self {
        ResourceStatus::Available
    }
}

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::Available => "AVAILABLE",
            ResourceStatus::Reserved => "RESERVED",
            ResourceStatus::Maintenance => "MAINTENANCE",
            ResourceStatus::OutOfService => "OUT_OF_SERVICE",
        }
    }
}

impl FromStr for ResourceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().replace(['-', ' '], "_").as_str() {
            "AVAILABLE" => Ok(ResourceStatus::Available),
            "RESERVED" => Ok(ResourceStatus::Reserved),
            "MAINTENANCE" => Ok(ResourceStatus::Maintenance),
            "OUT_OF_SERVICE" => Ok(ResourceStatus::OutOfService),
            _ => Err(format!("Invalid resource status '{}'", s.trim())),
        }
    }
}

/// Resource entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    pub status: ResourceStatus,
    pub capacity: Option<i32>,
    pub features: Vec<String>,
    pub location: Option<String>,
    pub building: Option<String>,
    pub floor: Option<String>,
    pub category_id: Option<Uuid>,
    pub attributes: serde_json::Value,
    pub program_ids: Vec<String>,
    pub metadata: serde_json::Value,
    pub created_by: Option<Uuid>,
    pub updated_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fixed field subset exposed to other services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceProjection {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    pub status: ResourceStatus,
    pub capacity: Option<i32>,
    pub features: Vec<String>,
    pub location: Option<String>,
    pub building: Option<String>,
    pub floor: Option<String>,
    pub description: Option<String>,
    pub metadata: serde_json::Value,
}

impl From<&Resource> for ResourceProjection {
    fn from(r: &Resource) -> Self {
        Self {
            id: r.id,
            name: r.name.clone(),
            resource_type: r.resource_type,
            status: r.status,
            capacity: r.capacity,
            features: r.features.clone(),
            location: r.location.clone(),
            building: r.building.clone(),
            floor: r.floor.clone(),
            description: r.description.clone(),
            metadata: r.metadata.clone(),
        }
    }
}

/// Resource category
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: Uuid,
    pub code: String,
    pub name: String,
}

/// Scheduled maintenance on a resource
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceRecord {
    pub id: Uuid,
    pub resource_id: Uuid,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub affects_availability: bool,
}

impl MaintenanceRecord {
    /// Half-open overlap with `[start, end)`
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.starts_at < end && start < self.ends_at
    }
}

/// Values for a resource about to be created
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewResource {
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub resource_type: Option<ResourceType>,
    pub status: Option<ResourceStatus>,
    pub capacity: Option<i32>,
    pub features: Vec<String>,
    pub location: Option<String>,
    pub building: Option<String>,
    pub floor: Option<String>,
    pub category_id: Option<Uuid>,
    pub attributes: Option<serde_json::Value>,
    pub program_ids: Vec<String>,
    pub created_by: Option<Uuid>,
}

/// Partial update; `None` leaves the stored value untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceChanges {
    pub name: Option<String>,
    pub description: Option<String>,
    pub resource_type: Option<ResourceType>,
    pub status: Option<ResourceStatus>,
    pub capacity: Option<i32>,
    pub features: Option<Vec<String>>,
    pub location: Option<String>,
    pub building: Option<String>,
    pub floor: Option<String>,
    pub category_id: Option<Uuid>,
    pub attributes: Option<serde_json::Value>,
    pub program_ids: Option<Vec<String>>,
    pub updated_by: Option<Uuid>,
}

impl ResourceChanges {
    /// Apply onto an in-memory resource
    pub fn apply_to(self, resource: &mut Resource) {
        if let Some(v) = self.name {
            resource.name = v;
        }
        if let Some(v) = self.description {
            resource.description = Some(v);
        }
        if let Some(v) = self.resource_type {
            resource.resource_type = v;
        }
        if let Some(v) = self.status {
            resource.status = v;
        }
        if let Some(v) = self.capacity {
            resource.capacity = Some(v);
        }
        if let Some(v) = self.features {
            resource.features = v;
        }
        if let Some(v) = self.location {
            resource.location = Some(v);
        }
        if let Some(v) = self.building {
            resource.building = Some(v);
        }
        if let Some(v) = self.floor {
            resource.floor = Some(v);
        }
        if let Some(v) = self.category_id {
            resource.category_id = Some(v);
        }
        if let Some(v) = self.attributes {
            resource.attributes = v;
        }
        if let Some(v) = self.program_ids {
            resource.program_ids = v;
        }
        if self.updated_by.is_some() {
            resource.updated_by = self.updated_by;
        }
        resource.updated_at = Utc::now();
    }
}

/// Candidate search criteria. Status is always `AVAILABLE`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateFilter {
    #[serde(skip)]
    pub resource_type: Option<ResourceType>,
    #[serde(skip)]
    pub exclude_id: Option<Uuid>,
    /// Minimum capacity
    #[serde(default)]
    pub capacity: Option<i32>,
    /// Every listed feature must be present
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub building: Option<String>,
    #[serde(default)]
    pub floor: Option<String>,
}

impl CandidateFilter {
    pub fn matches(&self, r: &Resource) -> bool {
        if r.status != ResourceStatus::Available {
            return false;
        }
        if self.resource_type.is_some_and(|t| t != r.resource_type) {
            return false;
        }
        if self.exclude_id == Some(r.id) {
            return false;
        }
        if let Some(min) = self.capacity {
            if r.capacity.unwrap_or(0) < min {
                return false;
            }
        }
        if !self.features.iter().all(|f| r.features.contains(f)) {
            return false;
        }
        if let Some(ref loc) = self.location {
            let matches = r
                .location
                .as_deref()
                .is_some_and(|l| l.to_lowercase().contains(&loc.to_lowercase()));
            if !matches {
                return false;
            }
        }
        if self.building.is_some() && self.building != r.building {
            return false;
        }
        if self.floor.is_some() && self.floor != r.floor {
            return false;
        }
        true
    }
}
