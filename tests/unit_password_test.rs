use emberlink::api::connection::check_password;

#[tokio::test]
async fn test_matching_password_accepted() {
    assert!(check_password("hunter2", "hunter2"));
}

#[tokio::test]
async fn test_empty_matches_empty() {
    assert!(check_password("", ""));
}

#[tokio::test]
async fn test_wrong_password_rejected() {
    assert!(!check_password("hunter2", "hunter3"));
}

#[tokio::test]
async fn test_mismatch_position_is_irrelevant() {
    // Same length, differing in first, middle, and last byte.
    assert!(!check_password("abcdefgh", "Xbcdefgh"));
    assert!(!check_password("abcdefgh", "abcdXfgh"));
    assert!(!check_password("abcdefgh", "abcdefgX"));
}

#[tokio::test]
async fn test_length_mismatch_rejected() {
    assert!(!check_password("hunter2", "hunter"));
    assert!(!check_password("hunter2", "hunter22"));
    assert!(!check_password("hunter2", ""));
    assert!(!check_password("", "hunter2"));
}

#[tokio::test]
async fn test_prefix_is_not_enough() {
    assert!(!check_password("secret", "secr"));
    assert!(!check_password("secr", "secret"));
}
