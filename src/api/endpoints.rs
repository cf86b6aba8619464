//! Endpoint paths of the remote API.

pub const PROJECTS: &str = "/projects";
pub const BENEFICIARIES: &str = "/beneficiaries";
pub const FORM_TEMPLATES: &str = "/forms/templates";
pub const FORM_RESPONSES: &str = "/forms/responses";
pub const USERS: &str = "/users";
pub const SERVICES: &str = "/services";
pub const SERVICE_ASSIGNMENTS: &str = "/services/assignments";
pub const AUTH_LOGIN: &str = "/auth/login";

pub fn project_subprojects(project_id: &str) -> String {
  format!("/projects/{}/subprojects", project_id)
}

pub fn subproject_activities(subproject_id: &str) -> String {
  format!("/activities/subproject/{}", subproject_id)
}

pub fn subproject_users(subproject_id: &str) -> String {
  format!("/subprojects/{}/users", subproject_id)
}

pub fn form_template(template_id: &str) -> String {
  format!("/forms/templates/{}", template_id)
}

pub fn user_projects(user_id: &str) -> String {
  format!("/users/{}/projects", user_id)
}
