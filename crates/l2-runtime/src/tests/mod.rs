//! End-to-end tests of admission, application and block production
