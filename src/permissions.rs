//! Authorization predicates for admin users.
//!
//! Everything here is pure: callers load the rows, these functions decide.

use serde::{Deserialize, Serialize};

use crate::types::AdminUser;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SuperAdmin,
    PartnerAdmin,
    OrgAdmin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::SuperAdmin => "super_admin",
            Role::PartnerAdmin => "partner_admin",
            Role::OrgAdmin => "org_admin",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "super_admin" => Some(Role::SuperAdmin),
            "partner_admin" => Some(Role::PartnerAdmin),
            "org_admin" => Some(Role::OrgAdmin),
            _ => None,
        }
    }
}

/// Which organisations a user may see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrganisationScope {
    All,
    Partner(String),
    Organisation(String),
    Nothing,
}

impl OrganisationScope {
    /// Binds for `($a::text IS NULL OR o.partner_id = $a) AND ($b::text IS NULL OR o.id = $b)`.
    pub fn binds(&self) -> (Option<String>, Option<String>) {
        match self {
            OrganisationScope::All => (None, None),
            OrganisationScope::Partner(id) => (Some(id.clone()), None),
            OrganisationScope::Organisation(id) => (None, Some(id.clone())),
            OrganisationScope::Nothing => (Some(String::new()), Some(String::new())),
        }
    }
}

pub fn organisation_scope(user: &AdminUser) -> OrganisationScope {
    match user.role {
        Role::SuperAdmin => OrganisationScope::All,
        Role::PartnerAdmin => match &user.partner_id {
            Some(id) => OrganisationScope::Partner(id.clone()),
            None => OrganisationScope::Nothing,
        },
        Role::OrgAdmin => match &user.organisation_id {
            Some(id) => OrganisationScope::Organisation(id.clone()),
            None => OrganisationScope::Nothing,
        },
    }
}

pub fn can_access_organisation(user: &AdminUser, org_id: &str, org_partner_id: Option<&str>) -> bool {
    match user.role {
        Role::SuperAdmin => true,
        Role::PartnerAdmin => match (user.partner_id.as_deref(), org_partner_id) {
            (Some(mine), Some(theirs)) => mine == theirs,
            _ => false,
        },
        Role::OrgAdmin => user.organisation_id.as_deref() == Some(org_id),
    }
}

pub fn can_read_partner(user: &AdminUser, partner_id: &str) -> bool {
    match user.role {
        Role::SuperAdmin => true,
        Role::PartnerAdmin => user.partner_id.as_deref() == Some(partner_id),
        Role::OrgAdmin => false,
    }
}

pub fn is_super_admin(user: &AdminUser) -> bool {
    user.role == Role::SuperAdmin
}

/// Partner records and branding. Partner admins only read their own partner.
pub fn can_write_partner(user: &AdminUser) -> bool {
    is_super_admin(user)
}

pub fn can_create_organisation(user: &AdminUser, partner_id: Option<&str>) -> bool {
    match user.role {
        Role::SuperAdmin => true,
        Role::PartnerAdmin => partner_id.is_some() && user.partner_id.as_deref() == partner_id,
        Role::OrgAdmin => false,
    }
}

/// Agents and chat sessions may be deleted by super admins and by partner admins
/// over their own organisations.
pub fn can_delete_org_content(user: &AdminUser, org_id: &str, org_partner_id: Option<&str>) -> bool {
    user.role != Role::OrgAdmin && can_access_organisation(user, org_id, org_partner_id)
}

/// A role must carry exactly the ids it is scoped by.
pub fn validate_role_shape(
    role: Role,
    partner_id: Option<&str>,
    organisation_id: Option<&str>,
) -> Result<(), &'static str> {
    match role {
        Role::SuperAdmin if partner_id.is_none() && organisation_id.is_none() => Ok(()),
        Role::SuperAdmin => Err("super admins cannot be scoped to a partner or organisation"),
        Role::PartnerAdmin if partner_id.is_some() && organisation_id.is_none() => Ok(()),
        Role::PartnerAdmin => Err("partner admins need a partnerId and no organisationId"),
        Role::OrgAdmin if organisation_id.is_some() && partner_id.is_none() => Ok(()),
        Role::OrgAdmin => Err("organisation admins need an organisationId and no partnerId"),
    }
}

/// `org_partner_id` is the partner owning `organisation_id`, when one was given.
pub fn can_create_admin_user(
    actor: &AdminUser,
    role: Role,
    organisation_id: Option<&str>,
    org_partner_id: Option<&str>,
) -> bool {
    match actor.role {
        Role::SuperAdmin => true,
        Role::PartnerAdmin => {
            role == Role::OrgAdmin
                && organisation_id.is_some()
                && org_partner_id.is_some()
                && actor.partner_id.as_deref() == org_partner_id
        }
        Role::OrgAdmin => false,
    }
}

/// Read/update access to another admin account. `target_org_partner_id` is the
/// partner of the target's organisation, if any.
pub fn can_manage_admin_user(
    actor: &AdminUser,
    target: &AdminUser,
    target_org_partner_id: Option<&str>,
) -> bool {
    if actor.id == target.id {
        return true;
    }
    match actor.role {
        Role::SuperAdmin => true,
        Role::PartnerAdmin => {
            target.role == Role::OrgAdmin
                && actor.partner_id.is_some()
                && actor.partner_id.as_deref() == target_org_partner_id
        }
        Role::OrgAdmin => false,
    }
}

pub fn can_delete_admin_user(actor: &AdminUser, target: &AdminUser) -> bool {
    actor.role == Role::SuperAdmin && actor.id != target.id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str, role: Role, partner: Option<&str>, org: Option<&str>) -> AdminUser {
        AdminUser {
            id: id.to_string(),
            email: format!("{id}@example.com"),
            full_name: id.to_string(),
            role,
            partner_id: partner.map(str::to_string),
            organisation_id: org.map(str::to_string),
            active: true,
            created_at: String::new(),
            updated_at: String::new(),
            last_login_at: String::new(),
        }
    }

    #[test]
    fn only_super_admin_deletes_users() {
        let root = user("root", Role::SuperAdmin, None, None);
        let partner = user("p", Role::PartnerAdmin, Some("partner-1"), None);
        let org = user("o", Role::OrgAdmin, None, Some("org-1"));

        assert!(can_delete_admin_user(&root, &org));
        assert!(!can_delete_admin_user(&partner, &org));
        assert!(!can_delete_admin_user(&org, &partner));
        assert!(!can_delete_admin_user(&root, &root));
    }

    #[test]
    fn partner_branding_is_read_only_for_partner_admins() {
        let reseller = user("r", Role::PartnerAdmin, Some("p1"), None);
        assert!(can_read_partner(&reseller, "p1"));
        assert!(!can_write_partner(&reseller));
        assert!(!can_write_partner(&user("o", Role::OrgAdmin, Some("p1"), Some("o1"))));
        assert!(can_write_partner(&user("s", Role::SuperAdmin, None, None)));
    }

    #[test]
    fn partner_admin_reaches_only_own_organisations() {
        let partner = user("p", Role::PartnerAdmin, Some("partner-1"), None);
        assert!(can_access_organisation(&partner, "org-1", Some("partner-1")));
        assert!(!can_access_organisation(&partner, "org-2", Some("partner-2")));
        assert!(!can_access_organisation(&partner, "org-3", None));
        assert_eq!(
            organisation_scope(&partner),
            OrganisationScope::Partner("partner-1".into())
        );
    }

    #[test]
    fn org_admin_is_confined_to_its_organisation() {
        let org = user("o", Role::OrgAdmin, None, Some("org-1"));
        assert!(can_access_organisation(&org, "org-1", Some("partner-1")));
        assert!(!can_access_organisation(&org, "org-2", Some("partner-1")));
        assert!(!can_delete_org_content(&org, "org-1", Some("partner-1")));
        assert!(!can_create_organisation(&org, None));
    }

    #[test]
    fn misconfigured_accounts_see_nothing() {
        let orphan = user("x", Role::PartnerAdmin, None, None);
        assert_eq!(organisation_scope(&orphan), OrganisationScope::Nothing);
        assert!(!can_access_organisation(&orphan, "org-1", None));
        let (partner, org) = organisation_scope(&orphan).binds();
        assert_eq!(partner.as_deref(), Some(""));
        assert_eq!(org.as_deref(), Some(""));
    }

    #[test]
    fn partner_admin_creates_org_admins_under_own_partner_only() {
        let partner = user("p", Role::PartnerAdmin, Some("partner-1"), None);
        assert!(can_create_admin_user(
            &partner,
            Role::OrgAdmin,
            Some("org-1"),
            Some("partner-1")
        ));
        assert!(!can_create_admin_user(
            &partner,
            Role::OrgAdmin,
            Some("org-9"),
            Some("partner-2")
        ));
        assert!(!can_create_admin_user(
            &partner,
            Role::PartnerAdmin,
            None,
            None
        ));
        let org = user("o", Role::OrgAdmin, None, Some("org-1"));
        assert!(!can_create_admin_user(&org, Role::OrgAdmin, Some("org-1"), None));
    }

    #[test]
    fn role_shape_matches_scope_ids() {
        assert!(validate_role_shape(Role::SuperAdmin, None, None).is_ok());
        assert!(validate_role_shape(Role::SuperAdmin, Some("p"), None).is_err());
        assert!(validate_role_shape(Role::PartnerAdmin, Some("p"), None).is_ok());
        assert!(validate_role_shape(Role::OrgAdmin, None, Some("o")).is_ok());
        assert!(validate_role_shape(Role::OrgAdmin, Some("p"), Some("o")).is_err());
    }

    #[test]
    fn users_can_always_manage_themselves() {
        let org = user("o", Role::OrgAdmin, None, Some("org-1"));
        let other = user("o2", Role::OrgAdmin, None, Some("org-1"));
        assert!(can_manage_admin_user(&org, &org, Some("partner-1")));
        assert!(!can_manage_admin_user(&org, &other, Some("partner-1")));
    }

    #[test]
    fn role_names_round_trip() {
        for role in [Role::SuperAdmin, Role::PartnerAdmin, Role::OrgAdmin] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("owner"), None);
        assert_eq!(
            serde_json::to_string(&Role::PartnerAdmin).unwrap(),
            "\"partner_admin\""
        );
    }
}
