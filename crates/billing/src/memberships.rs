//! Memberships and invitations

use std::sync::Arc;

use squarelet_shared::{
    Invitation, InvitationId, Membership, OrgId, Organization, Role, UserId,
};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::invalidation::{InvalidationDispatcher, InvalidationModel};
use crate::store::{Store, StoreTx};

#[derive(Clone)]
pub struct MembershipService {
    store: Arc<dyn Store>,
    invalidation: InvalidationDispatcher,
}

impl MembershipService {
    pub fn new(store: Arc<dyn Store>, invalidation: InvalidationDispatcher) -> Self {
        Self {
            store,
            invalidation,
        }
    }

    /// Invite someone by email; only active admins may invite
    pub async fn invite(
        &self,
        org_id: OrgId,
        actor: UserId,
        email: &str,
    ) -> BillingResult<Invitation> {
        let email = email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(BillingError::Validation(format!(
                "'{}' is not a valid email address",
                email
            )));
        }

        let mut tx = self.store.begin().await?;
        let org = tx.lock_organization(org_id).await?;
        reject_individual(&org)?;
        require_admin(tx.as_mut(), org_id, actor).await?;

        let invitation = Invitation {
            id: InvitationId::new(),
            organization: org_id,
            email: Some(email.to_string()),
            user: None,
            request: false,
            created_at: OffsetDateTime::now_utc(),
        };
        tx.insert_invitation(&invitation).await?;
        tx.commit().await?;

        tracing::info!(org_id = %org_id, invitation_id = %invitation.id, "Invited member");
        Ok(invitation)
    }

    /// Ask to join an organization
    pub async fn request_to_join(&self, org_id: OrgId, user: UserId) -> BillingResult<Invitation> {
        let mut tx = self.store.begin().await?;
        let org = tx.lock_organization(org_id).await?;
        reject_individual(&org)?;
        if tx.memberships(org_id).await?.iter().any(|m| m.user == user) {
            return Err(BillingError::Validation(
                "You are already a member of this organization".to_string(),
            ));
        }

        let invitation = Invitation {
            id: InvitationId::new(),
            organization: org_id,
            email: None,
            user: Some(user),
            request: true,
            created_at: OffsetDateTime::now_utc(),
        };
        tx.insert_invitation(&invitation).await?;
        tx.commit().await?;

        tracing::info!(org_id = %org_id, user_id = %user, "Requested to join organization");
        Ok(invitation)
    }

    /// Accept an invitation or join request, creating a non-admin membership
    pub async fn accept(
        &self,
        invitation_id: InvitationId,
        user: UserId,
        role: Option<Role>,
    ) -> BillingResult<Membership> {
        let mut tx = self.store.begin().await?;
        let invitation = tx
            .take_invitation(invitation_id)
            .await?
            .ok_or_else(|| BillingError::NotFound("Invitation not found".to_string()))?;
        if invitation.user.is_some_and(|invited| invited != user) {
            return Err(BillingError::Validation(
                "This invitation belongs to another user".to_string(),
            ));
        }
        let org = tx.lock_organization(invitation.organization).await?;
        reject_individual(&org)?;

        let mut membership = Membership::new(org.id, user, false);
        if let Some(role) = role {
            membership.role = role;
        }
        tx.insert_membership(&membership).await?;
        tx.commit().await?;

        tracing::info!(org_id = %org.id, user_id = %user, role = %membership.role, "Accepted invitation");
        self.membership_changed(org.id, user).await;
        Ok(membership)
    }

    pub async fn reject(&self, invitation_id: InvitationId) -> BillingResult<()> {
        let mut tx = self.store.begin().await?;
        let invitation = tx
            .take_invitation(invitation_id)
            .await?
            .ok_or_else(|| BillingError::NotFound("Invitation not found".to_string()))?;
        tx.commit().await?;

        tracing::info!(org_id = %invitation.organization, invitation_id = %invitation.id, "Rejected invitation");
        Ok(())
    }

    pub async fn remove_member(&self, org_id: OrgId, user: UserId) -> BillingResult<()> {
        let mut tx = self.store.begin().await?;
        let org = tx.lock_organization(org_id).await?;
        reject_individual(&org)?;

        let memberships = tx.memberships(org_id).await?;
        let member = find_member(&memberships, user)?;
        if member.admin && member.is_active() && active_admins(&memberships) == 1 {
            return Err(BillingError::Validation(
                "An organization must keep at least one admin".to_string(),
            ));
        }
        tx.delete_membership(org_id, user).await?;
        tx.commit().await?;

        tracing::info!(org_id = %org_id, user_id = %user, "Removed member");
        self.membership_changed(org_id, user).await;
        Ok(())
    }

    pub async fn set_role(&self, org_id: OrgId, user: UserId, role: Role) -> BillingResult<Membership> {
        self.update(org_id, user, |m| m.role = role).await
    }

    pub async fn set_admin(&self, org_id: OrgId, user: UserId, admin: bool) -> BillingResult<Membership> {
        self.update(org_id, user, |m| m.admin = admin).await
    }

    async fn update(
        &self,
        org_id: OrgId,
        user: UserId,
        change: impl FnOnce(&mut Membership) + Send,
    ) -> BillingResult<Membership> {
        let mut tx = self.store.begin().await?;
        let org = tx.lock_organization(org_id).await?;
        reject_individual(&org)?;

        let memberships = tx.memberships(org_id).await?;
        let mut membership = find_member(&memberships, user)?.clone();
        let was_admin = membership.admin && membership.is_active();
        change(&mut membership);
        let is_admin = membership.admin && membership.is_active();
        if was_admin && !is_admin && active_admins(&memberships) == 1 {
            return Err(BillingError::Validation(
                "An organization must keep at least one admin".to_string(),
            ));
        }
        tx.update_membership(&membership).await?;
        tx.commit().await?;

        tracing::info!(
            org_id = %org_id,
            user_id = %user,
            admin = membership.admin,
            role = %membership.role,
            "Updated membership"
        );
        self.membership_changed(org_id, user).await;
        Ok(membership)
    }

    async fn membership_changed(&self, org: OrgId, user: UserId) {
        self.invalidation
            .dispatch(InvalidationModel::User, &[user.0])
            .await;
        self.invalidation
            .dispatch(InvalidationModel::Organization, &[org.0])
            .await;
    }
}

fn reject_individual(org: &Organization) -> BillingResult<()> {
    if org.individual {
        return Err(BillingError::Validation(
            "Individual organizations have a single member".to_string(),
        ));
    }
    Ok(())
}

fn find_member(memberships: &[Membership], user: UserId) -> BillingResult<&Membership> {
    memberships
        .iter()
        .find(|m| m.user == user)
        .ok_or_else(|| BillingError::NotFound("Membership not found".to_string()))
}

fn active_admins(memberships: &[Membership]) -> usize {
    memberships
        .iter()
        .filter(|m| m.admin && m.is_active())
        .count()
}

async fn require_admin(tx: &mut dyn StoreTx, org: OrgId, user: UserId) -> BillingResult<()> {
    let is_admin = tx
        .memberships(org)
        .await?
        .iter()
        .any(|m| m.user == user && m.admin && m.is_active());
    if !is_admin {
        return Err(BillingError::Validation(
            "Only organization admins may do that".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invalidation::MemorySink;
    use crate::store::MemoryStore;
    use squarelet_shared::{Client, ClientId, User};

    struct Fixture {
        store: Arc<MemoryStore>,
        sink: Arc<MemorySink>,
        service: MembershipService,
        org: Organization,
        admin: User,
        member: User,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemorySink::new());
        let org = Organization::new("Newsroom", false, false);
        let admin = User::new("alice", "alice@example.com", "Alice");
        let member = User::new("bob", "bob@example.com", "Bob");

        let mut tx = store.begin().await.unwrap();
        tx.insert_organization(&org).await.unwrap();
        tx.insert_user(&admin).await.unwrap();
        tx.insert_user(&member).await.unwrap();
        tx.insert_membership(&Membership::new(org.id, admin.id, true))
            .await
            .unwrap();
        tx.insert_client(&Client {
            id: ClientId::new(),
            name: "MuckRock".to_string(),
            owner: org.id,
            secret: "secret".to_string(),
            webhook_url: Some("https://example.com/hook".to_string()),
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let invalidation = InvalidationDispatcher::new(store.clone(), sink.clone());
        let service = MembershipService::new(store.clone(), invalidation);
        Fixture {
            store,
            sink,
            service,
            org,
            admin,
            member,
        }
    }

    #[tokio::test]
    async fn test_invite_and_accept() {
        let f = fixture().await;
        let invitation = f
            .service
            .invite(f.org.id, f.admin.id, "bob@example.com")
            .await
            .unwrap();
        assert!(!invitation.request);

        let membership = f
            .service
            .accept(invitation.id, f.member.id, Some(Role::Contributor))
            .await
            .unwrap();
        assert!(!membership.admin);
        assert_eq!(membership.role, Role::Contributor);
        assert!(f.store.invitations_for_org(f.org.id).await.unwrap().is_empty());
        assert_eq!(f.store.memberships_for_org(f.org.id).await.unwrap().len(), 2);

        let models: Vec<String> = f
            .sink
            .deliveries()
            .await
            .into_iter()
            .map(|d| d.event.model)
            .collect();
        assert_eq!(models, vec!["user", "organization"]);
    }

    #[tokio::test]
    async fn test_non_admin_cannot_invite() {
        let f = fixture().await;
        let err = f
            .service
            .invite(f.org.id, f.member.id, "carol@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[tokio::test]
    async fn test_request_to_join_then_reject() {
        let f = fixture().await;
        let request = f
            .service
            .request_to_join(f.org.id, f.member.id)
            .await
            .unwrap();
        assert!(request.request);
        assert!(f
            .service
            .request_to_join(f.org.id, f.admin.id)
            .await
            .is_err());

        f.service.reject(request.id).await.unwrap();
        assert!(matches!(
            f.service.reject(request.id).await,
            Err(BillingError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_membership_rejected() {
        let f = fixture().await;
        let first = f
            .service
            .invite(f.org.id, f.admin.id, "alice@example.com")
            .await
            .unwrap();
        let err = f.service.accept(first.id, f.admin.id, None).await.unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
        // The failed accept rolled back, so the invitation is still there
        assert_eq!(f.store.invitations_for_org(f.org.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_last_admin_is_kept() {
        let f = fixture().await;
        assert!(f.service.set_admin(f.org.id, f.admin.id, false).await.is_err());
        assert!(f.service.remove_member(f.org.id, f.admin.id).await.is_err());
        assert!(f
            .service
            .set_role(f.org.id, f.admin.id, Role::Disabled)
            .await
            .is_err());

        let invitation = f
            .service
            .invite(f.org.id, f.admin.id, "bob@example.com")
            .await
            .unwrap();
        f.service.accept(invitation.id, f.member.id, None).await.unwrap();
        f.service.set_admin(f.org.id, f.member.id, true).await.unwrap();
        f.service.remove_member(f.org.id, f.admin.id).await.unwrap();
        assert_eq!(f.store.memberships_for_org(f.org.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_individual_organization_never_gains_members() {
        let f = fixture().await;
        let individual = Organization::new("alice", true, false);
        let mut tx = f.store.begin().await.unwrap();
        tx.insert_organization(&individual).await.unwrap();
        tx.insert_membership(&Membership::new(individual.id, f.admin.id, true))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert!(f
            .service
            .request_to_join(individual.id, f.member.id)
            .await
            .is_err());
        assert!(f
            .service
            .invite(individual.id, f.admin.id, "bob@example.com")
            .await
            .is_err());
    }
}
