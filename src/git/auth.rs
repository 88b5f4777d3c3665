//! Credential plumbing for libgit2 remote callbacks.

use git2::{Cred, CredentialType, FetchOptions, RemoteCallbacks};

use crate::models::GitAuth;

// libgit2 re-invokes the credential callback after every rejection; without
// a cap a bad password loops forever against some servers.
const MAX_CRED_ATTEMPTS: usize = 3;

/// Build remote callbacks that answer credential requests from `auth`.
pub fn remote_callbacks(auth: Option<GitAuth>) -> RemoteCallbacks<'static> {
    let mut callbacks = RemoteCallbacks::new();
    let mut attempts = 0usize;

    callbacks.credentials(move |_url, username_from_url, allowed| {
        attempts += 1;
        if attempts > MAX_CRED_ATTEMPTS {
            return Err(git2::Error::new(
                git2::ErrorCode::Auth,
                git2::ErrorClass::Callback,
                "authentication rejected by remote",
            ));
        }

        match &auth {
            Some(GitAuth::Http { username, password })
                if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) =>
            {
                Cred::userpass_plaintext(username, password)
            }
            Some(GitAuth::Ssh { private_key, user })
                if allowed.contains(CredentialType::SSH_KEY) =>
            {
                let user = if user.is_empty() {
                    username_from_url.unwrap_or("git")
                } else {
                    user.as_str()
                };
                Cred::ssh_key_from_memory(user, None, private_key, None)
            }
            _ if allowed.contains(CredentialType::DEFAULT) => Cred::default(),
            _ => Err(git2::Error::new(
                git2::ErrorCode::Auth,
                git2::ErrorClass::Callback,
                "remote requires credentials the project does not have",
            )),
        }
    });

    callbacks
}

/// Fetch options carrying the credential callbacks.
pub fn fetch_options(auth: Option<GitAuth>) -> FetchOptions<'static> {
    let mut options = FetchOptions::new();
    options.remote_callbacks(remote_callbacks(auth));
    options
}
