//! Caching implementations for domain types.

use crate::store::{Cacheable, Table};

use super::types::{
  Activity, Beneficiary, EntityService, FormSubmission, FormTemplate, Project, ProjectUser,
  Service, Subproject, SubprojectUser, User,
};

// ============================================================================
// Cacheable implementations
// ============================================================================

impl Cacheable for Project {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn updated_at(&self) -> Option<&str> {
    self.updated_at.as_deref()
  }

  fn table() -> Table {
    Table::Projects
  }
}

impl Cacheable for Subproject {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn updated_at(&self) -> Option<&str> {
    self.updated_at.as_deref()
  }

  fn table() -> Table {
    Table::Subprojects
  }
}

impl Cacheable for Activity {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn updated_at(&self) -> Option<&str> {
    self.updated_at.as_deref()
  }

  fn table() -> Table {
    Table::Activities
  }
}

impl Cacheable for Beneficiary {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn updated_at(&self) -> Option<&str> {
    self.updated_at.as_deref()
  }

  fn table() -> Table {
    Table::Beneficiaries
  }
}

impl Cacheable for FormTemplate {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn updated_at(&self) -> Option<&str> {
    self.updated_at.as_deref()
  }

  fn table() -> Table {
    Table::FormTemplates
  }
}

impl Cacheable for FormSubmission {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn updated_at(&self) -> Option<&str> {
    self.updated_at.as_deref()
  }

  fn table() -> Table {
    Table::FormSubmissions
  }
}

impl Cacheable for User {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn updated_at(&self) -> Option<&str> {
    self.updated_at.as_deref()
  }

  fn table() -> Table {
    Table::Users
  }
}

impl Cacheable for Service {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn updated_at(&self) -> Option<&str> {
    self.updated_at.as_deref()
  }

  fn table() -> Table {
    Table::Services
  }
}

// Association rows carry no modification time

impl Cacheable for EntityService {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn updated_at(&self) -> Option<&str> {
    None
  }

  fn table() -> Table {
    Table::EntityServices
  }
}

impl Cacheable for ProjectUser {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn updated_at(&self) -> Option<&str> {
    None
  }

  fn table() -> Table {
    Table::ProjectUsers
  }
}

impl Cacheable for SubprojectUser {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn updated_at(&self) -> Option<&str> {
    None
  }

  fn table() -> Table {
    Table::SubprojectUsers
  }
}
