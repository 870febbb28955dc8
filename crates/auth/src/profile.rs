//! Profile update requests and the propagation decision.

/// Raw image uploaded as a new avatar.
#[derive(Clone, PartialEq, Eq)]
pub struct AvatarUpload {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl core::fmt::Debug for AvatarUpload {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AvatarUpload")
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// One profile update call. Exactly one branch applies per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileUpdate {
    /// A new avatar image was uploaded.
    Avatar(AvatarUpload),
    /// Password change, authorized by the current password.
    ChangePassword {
        current_password: String,
        new_password: String,
    },
    /// General profile fields.
    General { display_name: Option<String> },
}

impl ProfileUpdate {
    /// Classify raw request fields.
    ///
    /// Precedence: an uploaded avatar wins, then a complete password pair,
    /// then general fields. A lone `current_password` or `new_password` is
    /// ignored.
    pub fn from_request(
        avatar: Option<AvatarUpload>,
        current_password: Option<String>,
        new_password: Option<String>,
        display_name: Option<String>,
    ) -> Self {
        if let Some(upload) = avatar {
            return ProfileUpdate::Avatar(upload);
        }

        let non_empty = |s: Option<String>| s.filter(|v| !v.is_empty());
        match (non_empty(current_password), non_empty(new_password)) {
            (Some(current_password), Some(new_password)) => ProfileUpdate::ChangePassword {
                current_password,
                new_password,
            },
            _ => ProfileUpdate::General {
                display_name: display_name.map(|n| n.trim().to_string()),
            },
        }
    }

    /// Whether the update touches fields duplicated into comments.
    ///
    /// True iff a new avatar was uploaded or the display name field was set.
    pub fn requires_propagation(&self) -> bool {
        match self {
            ProfileUpdate::Avatar(_) => true,
            ProfileUpdate::ChangePassword { .. } => false,
            ProfileUpdate::General { display_name } => {
                display_name.as_deref().is_some_and(|n| !n.is_empty())
            }
        }
    }
}
